use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Per-workspace configuration, read from `instructord.toml` in the
/// workspace directory. Every field has a default so a missing file is a
/// valid (local-only) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Platform name used in notification mail.
    #[serde(default = "default_site_name")]
    pub site_name: String,

    /// Base URL of the learning platform, for course/progress links.
    #[serde(default = "default_lms_base_url")]
    pub lms_base_url: String,

    /// Remote gradebook endpoint; empty means not configured.
    #[serde(default)]
    pub remote_gradebook_url: String,

    /// Fallback gradebook name when the course record has none.
    #[serde(default)]
    pub remote_gradebook_default_name: String,

    /// Analytics endpoint; empty means not configured.
    #[serde(default)]
    pub analytics_url: String,

    #[serde(default)]
    pub analytics_api_key: String,

    /// Salt mixed into anonymized student ids.
    #[serde(default = "default_anon_salt")]
    pub anon_salt: String,

    /// Gate for bulk course email submission.
    #[serde(default)]
    pub email_enabled: bool,

    /// Above this enrollment count the dashboard overview flags the course
    /// as large, steering whole-course dumps through the task runner.
    #[serde(default = "default_max_enrollment_for_dumps")]
    pub max_enrollment_for_dumps: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_name: default_site_name(),
            lms_base_url: default_lms_base_url(),
            remote_gradebook_url: String::new(),
            remote_gradebook_default_name: String::new(),
            analytics_url: String::new(),
            analytics_api_key: String::new(),
            anon_salt: default_anon_salt(),
            email_enabled: false,
            max_enrollment_for_dumps: default_max_enrollment_for_dumps(),
        }
    }
}

impl Config {
    pub fn load(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join("instructord.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn course_url(&self, course_key: &str) -> String {
        format!("{}/courses/{}", self.lms_base_url.trim_end_matches('/'), course_key)
    }

    pub fn course_about_url(&self, course_key: &str) -> String {
        format!("{}/about", self.course_url(course_key))
    }

    pub fn registration_url(&self) -> String {
        format!("{}/register", self.lms_base_url.trim_end_matches('/'))
    }

    pub fn progress_url(&self, course_key: &str, user_id: &str) -> String {
        format!("{}/progress/{}", self.course_url(course_key), user_id)
    }
}

fn default_site_name() -> String {
    "localhost".to_string()
}

fn default_lms_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_anon_salt() -> String {
    "instructord".to_string()
}

fn default_max_enrollment_for_dumps() -> i64 {
    200
}
