//! Panic payload extraction.

use std::any::Any;

/// Best-effort message of a caught panic payload.
///
/// `panic!("literal")` carries a `&'static str`, formatted panics carry a
/// `String`; anything else is reported as unknown.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<unknown panic>".to_string()
    }
}
