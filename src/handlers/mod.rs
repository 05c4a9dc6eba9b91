//! One module per step type named by the data model (§4.3). Each
//! implements [`crate::registry::StepHandler`]; none know about the
//! durable log, the manager, or each other.

pub mod ansible_playbook;
pub mod apt_package;
pub mod custom_script;
pub mod file_copy;
pub mod systemd_service;
pub mod user_management;
