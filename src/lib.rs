//! Library crate for `imsd`: a workstation daemon that impersonates the cloud
//! instance-metadata credential endpoint so local tools can obtain short-lived
//! session credentials without touching the user's real AWS profile files.

pub mod control;
pub mod engine;
pub mod error;
pub mod fake_engine;
pub mod guard;
pub mod http;
pub mod profile;
pub mod sts;
