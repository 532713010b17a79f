//! Validation helpers for DTOs.

use validator::ValidationError;

/// Validates that a display name has no surrounding blanks or control characters.
///
/// # Examples
///
/// ```ignore
/// validate_display_name("Quetzal")  // Ok
/// validate_display_name(" Quetzal") // Err - leading blank
/// validate_display_name("Que\tzal") // Err - control character
/// ```
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim() != name {
        let mut err = ValidationError::new("display_name_blank");
        err.message = Some("Display name cannot start or end with blanks".into());
        return Err(err);
    }

    if name.chars().any(char::is_control) {
        let mut err = ValidationError::new("display_name_format");
        err.message = Some("Display name cannot contain control characters".into());
        return Err(err);
    }

    Ok(())
}
