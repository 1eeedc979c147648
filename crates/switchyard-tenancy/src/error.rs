use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("organization name must not be empty")]
    EmptyOrganization,

    #[error("organization '{0}' configured twice")]
    DuplicateOrganization(String),

    #[error("heartbeat interval must be positive")]
    InvalidInterval,
}
