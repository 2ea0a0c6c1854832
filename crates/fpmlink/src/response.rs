//! Turns the worker's CGI response stream into the platform's response shape.

use crate::event::{HeaderValue, HttpResponse};
use std::collections::HashMap;
use std::error;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Eq, PartialEq)]
pub enum ResponseError {
    /// No `\r\n\r\n` between header block and body.
    MissingHeaderBlock,
    /// The `Status` header did not start with an integer in 100..=599.
    UnparseableStatus(String),
}

impl Display for ResponseError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ResponseError::MissingHeaderBlock => write!(f, "response carries no header block"),
            ResponseError::UnparseableStatus(value) => {
                write!(f, "unparseable Status header {value:?}")
            }
        }
    }
}

impl error::Error for ResponseError {}

/// Split the worker's stdout into status, headers, and body. Header names
/// come out lowercase; `has_multi_header` selects whether repeated headers
/// keep all their values in order or collapse to the last one.
pub fn translate_response(
    stdout: &[u8],
    has_multi_header: bool,
) -> Result<HttpResponse, ResponseError> {
    let separator = stdout
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or(ResponseError::MissingHeaderBlock)?;
    let head = String::from_utf8_lossy(&stdout[..separator]);
    let body = stdout[separator + 4..].to_vec();

    let mut status = None;
    let mut headers: Vec<(String, Vec<String>)> = Vec::new();
    for line in head.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        let value = value.trim().to_string();
        if name == "status" {
            // The first occurrence wins; the value may carry a reason phrase.
            if status.is_none() {
                status = Some(parse_status(&value)?);
            }
            continue;
        }
        match headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value),
            None => headers.push((name, vec![value])),
        }
    }

    let headers = headers
        .into_iter()
        .filter_map(|(name, values)| {
            let value = if has_multi_header {
                HeaderValue::Multi(values)
            } else {
                HeaderValue::Single(values.into_iter().last()?)
            };
            Some((name, value))
        })
        .collect::<HashMap<_, _>>();

    Ok(HttpResponse {
        status: status.unwrap_or(200),
        headers,
        body,
    })
}

fn parse_status(value: &str) -> Result<u16, ResponseError> {
    let token = value.split_whitespace().next().unwrap_or("");
    match token.parse::<u16>() {
        Ok(status) if (100..=599).contains(&status) => Ok(status),
        _ => Err(ResponseError::UnparseableStatus(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_status_headers_and_body() {
        let response = translate_response(
            b"Status: 201\r\nContent-Type: text/plain\r\n\r\nok",
            false,
        )
        .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(
            response.headers,
            HashMap::from([(
                "content-type".to_string(),
                HeaderValue::Single("text/plain".to_string()),
            )])
        );
        assert_eq!(response.body, b"ok");
    }

    #[test]
    fn status_defaults_to_200() {
        let response = translate_response(b"Content-Type: text/plain\r\n\r\nhi", false).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn header_names_come_out_lowercase() {
        let response = translate_response(
            b"X-CUSTOM-Header: yes\r\nCONTENT-type: text/html\r\n\r\n",
            false,
        )
        .unwrap();
        assert!(response.headers.contains_key("x-custom-header"));
        assert!(response.headers.contains_key("content-type"));
    }

    #[test]
    fn repeated_headers_keep_every_value_in_multi_mode() {
        let response = translate_response(
            b"Set-Cookie: a\r\nSet-Cookie: b\r\n\r\n",
            true,
        )
        .unwrap();
        assert_eq!(
            response.headers["set-cookie"],
            HeaderValue::Multi(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn repeated_headers_collapse_to_the_last_value_in_single_mode() {
        let response = translate_response(
            b"Set-Cookie: a\r\nSet-Cookie: b\r\n\r\n",
            false,
        )
        .unwrap();
        assert_eq!(
            response.headers["set-cookie"],
            HeaderValue::Single("b".to_string())
        );
    }

    #[test]
    fn a_reason_phrase_after_the_status_code_is_tolerated() {
        let response = translate_response(b"Status: 404 Not Found\r\n\r\n", false).unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.headers.contains_key("status"));
    }

    #[test]
    fn a_non_numeric_status_is_rejected() {
        assert_eq!(
            translate_response(b"Status: teapot\r\n\r\n", false).unwrap_err(),
            ResponseError::UnparseableStatus("teapot".to_string())
        );
    }

    #[test]
    fn an_out_of_range_status_is_rejected() {
        assert_eq!(
            translate_response(b"Status: 99\r\n\r\n", false).unwrap_err(),
            ResponseError::UnparseableStatus("99".to_string())
        );
    }

    #[test]
    fn a_stream_without_a_header_block_is_rejected() {
        assert_eq!(
            translate_response(b"no separator here", false).unwrap_err(),
            ResponseError::MissingHeaderBlock
        );
    }

    #[test]
    fn binary_bodies_pass_through_untouched() {
        let mut stdout = b"Content-Type: application/octet-stream\r\n\r\n".to_vec();
        stdout.extend_from_slice(&[0, 159, 146, 150]);
        let response = translate_response(&stdout, false).unwrap();
        assert_eq!(response.body, vec![0, 159, 146, 150]);
    }
}
