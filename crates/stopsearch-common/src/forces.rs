//! The fixed set of upstream police force identifiers
//!
//! These are the force slugs the upstream API accepts as the `force` request
//! parameter. The list changes rarely; when it does, the availability endpoint
//! is the source of truth and this list only gates local configuration.

use crate::error::{Result, StopSearchError};

/// Every force identifier the upstream API currently exposes.
pub const AVAILABLE_FORCES: [&str; 36] = [
    "avon-and-somerset",
    "btp",
    "cambridgeshire",
    "cheshire",
    "city-of-london",
    "cleveland",
    "cumbria",
    "derbyshire",
    "devon-and-cornwall",
    "dorset",
    "durham",
    "essex",
    "gloucestershire",
    "hampshire",
    "hertfordshire",
    "kent",
    "lancashire",
    "leicestershire",
    "merseyside",
    "metropolitan",
    "norfolk",
    "north-wales",
    "northamptonshire",
    "northumbria",
    "nottinghamshire",
    "south-wales",
    "south-yorkshire",
    "staffordshire",
    "suffolk",
    "surrey",
    "sussex",
    "thames-valley",
    "warwickshire",
    "west-mercia",
    "west-midlands",
    "west-yorkshire",
];

/// Whether `id` names a known force.
pub fn is_known_force(id: &str) -> bool {
    AVAILABLE_FORCES.contains(&id)
}

/// Validate a configured force identifier, returning it on success.
pub fn validate_force(id: &str) -> Result<&str> {
    if is_known_force(id) {
        Ok(id)
    } else {
        Err(StopSearchError::UnknownForce(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_forces_validate() {
        assert!(is_known_force("metropolitan"));
        assert!(is_known_force("leicestershire"));
        assert!(validate_force("btp").is_ok());
    }

    #[test]
    fn unknown_force_is_rejected() {
        assert!(!is_known_force("gotham"));
        assert!(matches!(
            validate_force("gotham"),
            Err(StopSearchError::UnknownForce(_))
        ));
    }
}
