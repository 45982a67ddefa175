use crate::constants::{MAX_ADDRESS_STR_LEN, MAX_POOL_ID_LEN};
use crate::error::AppError;

pub fn ensure_len_le(field: &str, s: &str, max: usize) -> Result<(), AppError> {
    if s.len() > max {
        return Err(AppError::BadRequest(format!(
            "{field} too long: {} chars (max {max})",
            s.len()
        )));
    }
    Ok(())
}

pub fn ensure_address_len(field: &str, s: &str) -> Result<(), AppError> {
    let t = s.trim();
    if t.is_empty() {
        return Err(AppError::BadRequest(format!("{field} is required")));
    }
    ensure_len_le(field, t, MAX_ADDRESS_STR_LEN)
}

pub fn ensure_pool_id(s: &str) -> Result<(), AppError> {
    let t = s.trim();
    if t.is_empty() {
        return Err(AppError::BadRequest("pool_id is required".into()));
    }
    ensure_len_le("pool_id", t, MAX_POOL_ID_LEN)?;
    if !t
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::BadRequest(
            "pool_id may only contain [A-Za-z0-9_-]".into(),
        ));
    }
    Ok(())
}
