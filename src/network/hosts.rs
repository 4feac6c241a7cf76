//! Hosts and resolver files shared by every instance of a project

use super::pool::AddressAssignment;
use crate::error::Result;
use std::path::{Path, PathBuf};

/// Hosts file written into the project working directory
pub const HOSTS_FILE: &str = "etc.hosts";

/// Resolver file written into the project working directory
pub const RESOLV_FILE: &str = "resolv.conf";

const HOSTS_TEMPLATE: &str = include_str!("../../templates/hosts");
const RESOLV_TEMPLATE: &str = include_str!("../../templates/resolv.conf");

/// Writes the hosts and resolver files bound into instances
pub struct HostsSynthesizer {
    working_dir: PathBuf,
    template: Vec<String>,
}

impl HostsSynthesizer {
    /// Create a synthesizer using the bundled hosts template
    pub fn new(working_dir: &Path) -> Self {
        Self::with_template(working_dir, HOSTS_TEMPLATE.lines().map(String::from).collect())
    }

    /// Create a synthesizer with custom base lines
    pub fn with_template(working_dir: &Path, template: Vec<String>) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            template,
        }
    }

    /// Path of the hosts file
    pub fn hosts_path(&self) -> PathBuf {
        self.working_dir.join(HOSTS_FILE)
    }

    /// Path of the resolver file
    pub fn resolv_path(&self) -> PathBuf {
        self.working_dir.join(RESOLV_FILE)
    }

    /// Render hosts content: one `<ip>\t<name>` line per assignment, then
    /// the base template
    pub fn synthesize(template: &[String], assignment: &AddressAssignment) -> String {
        let mut content = String::new();

        for (name, address) in assignment {
            content.push_str(&format!("{}\t{}\n", address, name));
        }

        for line in template {
            content.push_str(line);
            content.push('\n');
        }

        content
    }

    /// Write the hosts file for `assignment`, replacing any previous one
    pub fn write_hosts(&self, assignment: &AddressAssignment) -> Result<PathBuf> {
        let path = self.hosts_path();
        std::fs::write(&path, Self::synthesize(&self.template, assignment))?;
        tracing::debug!("Wrote {} with {} entries", path.display(), assignment.len());
        Ok(path)
    }

    /// Write the resolver file unless it already exists
    pub fn resolv_conf(&self) -> Result<PathBuf> {
        let path = self.resolv_path();
        if !path.exists() {
            std::fs::write(&path, RESOLV_TEMPLATE)?;
            tracing::debug!("Wrote {}", path.display());
        }
        Ok(path)
    }

    /// Bind specs mounting both files read-only
    pub fn bind_specs(hosts: &Path, resolv: &Path) -> Vec<String> {
        vec![
            format!("{}:/etc/resolv.conf:ro", resolv.display()),
            format!("{}:/etc/hosts:ro", hosts.display()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[test]
    fn test_synthesize() {
        let mut assignment = AddressAssignment::new();
        assignment.insert("app".to_string(), Ipv4Addr::new(10, 22, 0, 2));
        assignment.insert("db".to_string(), Ipv4Addr::new(10, 22, 0, 3));

        let content =
            HostsSynthesizer::synthesize(&["127.0.0.1\tlocalhost".to_string()], &assignment);
        assert_eq!(
            content,
            "10.22.0.2\tapp\n10.22.0.3\tdb\n127.0.0.1\tlocalhost\n"
        );
    }

    #[test]
    fn test_write_hosts_replaces() {
        let temp = tempdir().unwrap();
        let synthesizer = HostsSynthesizer::new(temp.path());

        let mut assignment = AddressAssignment::new();
        assignment.insert("app".to_string(), Ipv4Addr::new(10, 22, 0, 2));
        synthesizer.write_hosts(&assignment).unwrap();

        assignment.insert("db".to_string(), Ipv4Addr::new(10, 22, 0, 3));
        let path = synthesizer.write_hosts(&assignment).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.matches("\tapp\n").count(), 1);
        assert!(content.contains("10.22.0.3\tdb\n"));
        assert!(content.contains("localhost"));
    }

    #[test]
    fn test_resolv_conf_written_once() {
        let temp = tempdir().unwrap();
        let synthesizer = HostsSynthesizer::new(temp.path());

        let path = synthesizer.resolv_conf().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("nameserver"));

        std::fs::write(&path, "nameserver 1.1.1.1\n").unwrap();
        synthesizer.resolv_conf().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 1.1.1.1\n");
    }

    #[test]
    fn test_bind_specs() {
        let binds =
            HostsSynthesizer::bind_specs(Path::new("/p/etc.hosts"), Path::new("/p/resolv.conf"));
        assert_eq!(
            binds,
            vec!["/p/resolv.conf:/etc/resolv.conf:ro", "/p/etc.hosts:/etc/hosts:ro"]
        );
    }
}
