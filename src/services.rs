//! Example text services registered by the binary.

use crate::app::App;
use crate::registry::ServiceError;
use serde::Serialize;

#[derive(Serialize)]
struct Transformed<'a> {
    service: &'static str,
    input: &'a str,
    output: String,
}

#[derive(Serialize)]
struct Measured<'a> {
    service: &'static str,
    input: &'a str,
    length: usize,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ServiceError> {
    serde_json::to_string(value).map_err(|e| ServiceError::new(e.to_string()))
}

/// Returns the input unchanged.
pub fn echo(input: &str) -> Result<String, ServiceError> {
    to_json(&Transformed {
        service: "echo",
        input,
        output: input.to_string(),
    })
}

/// ASCII upper-casing; other bytes pass through.
pub fn upper(input: &str) -> Result<String, ServiceError> {
    to_json(&Transformed {
        service: "upper",
        input,
        output: input.to_ascii_uppercase(),
    })
}

/// Reverses the input byte-wise. Multi-byte characters do not survive.
pub fn reverse(input: &str) -> Result<String, ServiceError> {
    let mut bytes = input.as_bytes().to_vec();
    bytes.reverse();
    to_json(&Transformed {
        service: "reverse",
        input,
        output: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Length of the input in bytes.
pub fn length(input: &str) -> Result<String, ServiceError> {
    to_json(&Measured {
        service: "length",
        input,
        length: input.len(),
    })
}

/// Register `echo`, `upper`, `reverse` and `length`.
pub fn register_example_services(app: &App) {
    app.register_body_service("echo", echo);
    app.register_body_service("upper", upper);
    app.register_body_service("reverse", reverse);
    app.register_body_service("length", length);
}
