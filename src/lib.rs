pub mod config;
pub mod gcloud;
