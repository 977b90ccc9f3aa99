pub mod analytics;
pub mod core;
pub mod courses;
pub mod email;
pub mod enrollment;
pub mod gradebook;
pub mod grades;
pub mod problems;
pub mod reports;
pub mod roles;
pub mod tasks;
pub mod users;
