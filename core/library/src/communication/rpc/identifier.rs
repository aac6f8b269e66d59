//! Generation of correlation identifiers

use uuid::Uuid;

/// Generates a new random (version 4) correlation identifier
///
/// With 122 random bits, two identifiers that are outstanding at the same time will
/// practically never collide.
pub fn generate() -> Uuid {
    Uuid::new_v4()
}
