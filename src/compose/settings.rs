//! Where a project comes from: compose files, working directory and name

use super::config::{ProjectConfig, DEFAULT_COMPOSE_FILE};
use super::parser::ComposeParser;
use crate::error::Result;
use serde_yaml::Value;
use std::path::{Path, PathBuf};

/// Project location and naming, as given on the command line
#[derive(Debug, Clone, Default)]
pub struct ProjectSettings {
    /// Compose files, merged in order
    pub files: Vec<PathBuf>,
    /// Explicit project name
    pub project_name: Option<String>,
    /// Explicit working directory
    pub project_directory: Option<PathBuf>,
    /// Extra variables for interpolation
    pub env_file: Option<PathBuf>,
}

impl ProjectSettings {
    /// Compose files, falling back to the default file name
    pub fn files(&self) -> Vec<PathBuf> {
        if self.files.is_empty() {
            vec![PathBuf::from(DEFAULT_COMPOSE_FILE)]
        } else {
            self.files.clone()
        }
    }

    /// Working directory: `--project-directory`, else the directory of the
    /// first compose file
    pub fn working_dir(&self) -> Result<PathBuf> {
        let cwd = std::env::current_dir()?;

        if let Some(dir) = &self.project_directory {
            return Ok(cwd.join(dir));
        }

        let first = self.files().remove(0);
        Ok(cwd
            .join(first)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(cwd))
    }

    /// Project name, lowercased: `--project-name`, else the basename of the
    /// working directory
    pub fn project_name(&self) -> Result<String> {
        let name = match &self.project_name {
            Some(name) => name.clone(),
            None => self
                .working_dir()?
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "default".to_string()),
        };

        Ok(name.to_lowercase())
    }

    /// Merged and interpolated compose document
    pub fn load_document(&self) -> Result<Value> {
        let mut document = ComposeParser::load_files(&self.files())?;
        let env = ComposeParser::environment(self.env_file.as_deref())?;
        ComposeParser::interpolate(&mut document, &env);
        Ok(document)
    }

    /// Typed project configuration
    pub fn load_config(&self) -> Result<ProjectConfig> {
        ComposeParser::parse_value(self.load_document()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_working_dir_and_name() {
        let temp = tempdir().unwrap();
        let project = temp.path().join("MyProject");
        std::fs::create_dir_all(&project).unwrap();

        let settings = ProjectSettings {
            files: vec![project.join("singularity-compose.yml")],
            ..Default::default()
        };
        assert_eq!(settings.working_dir().unwrap(), project);
        assert_eq!(settings.project_name().unwrap(), "myproject");

        let settings = ProjectSettings {
            files: vec![project.join("singularity-compose.yml")],
            project_name: Some("Demo".to_string()),
            project_directory: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(settings.working_dir().unwrap(), temp.path());
        assert_eq!(settings.project_name().unwrap(), "demo");
    }

    #[test]
    fn test_load_merges_and_interpolates() {
        let temp = tempdir().unwrap();
        let base = temp.path().join("singularity-compose.yml");
        let overlay = temp.path().join("override.yml");
        let env = temp.path().join(".env");

        std::fs::write(
            &base,
            "version: \"2.0\"\ninstances:\n  app:\n    image: docker://nginx:${TAG:-stable}\n",
        )
        .unwrap();
        std::fs::write(&overlay, "instances:\n  app:\n    ports: [\"${PORT}\"]\n").unwrap();
        std::fs::write(&env, "TAG=1.25\nPORT=8080\n").unwrap();

        let settings = ProjectSettings {
            files: vec![base, overlay],
            env_file: Some(env),
            ..Default::default()
        };
        let config = settings.load_config().unwrap();
        let app = config.get("app").unwrap();
        assert_eq!(app.image.as_deref(), Some("docker://nginx:1.25"));
        assert_eq!(app.ports, vec!["8080"]);
    }
}
