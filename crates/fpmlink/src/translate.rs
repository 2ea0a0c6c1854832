//! Builds the responder FastCGI request for one invocation.

use crate::event::{Context, HttpRequestEvent};
use fpmlink_fcgi::proto::FcgiRequest;
use std::path::PathBuf;

/// Ordered CGI parameter map. Setting an existing key overwrites its value in
/// place, so later writes win and the wire order stays stable.
#[derive(Debug, Default)]
struct Params(Vec<(String, String)>);

impl Params {
    fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }
}

pub struct RequestTranslator {
    /// The script that serves every request.
    handler: PathBuf,
}

impl RequestTranslator {
    pub fn new(handler: impl Into<PathBuf>) -> Self {
        RequestTranslator {
            handler: handler.into(),
        }
    }

    /// The CGI/1.1 environment plus stdin for one invocation. The invocation
    /// context and the event's request context ride along as JSON so the
    /// application can read them.
    pub fn translate(
        &self,
        event: &HttpRequestEvent,
        context: &Context,
    ) -> Result<FcgiRequest, serde_json::Error> {
        let mut params = Params::default();
        params.set("GATEWAY_INTERFACE", "CGI/1.1");
        params.set("REQUEST_METHOD", event.method.as_str());
        params.set("REQUEST_URI", event.uri.as_str());
        params.set("SCRIPT_FILENAME", self.handler.display().to_string());
        params.set("SERVER_NAME", event.server_name.as_str());
        params.set("SERVER_PROTOCOL", event.protocol.as_str());
        params.set("SERVER_PORT", event.server_port.to_string());
        params.set("SERVER_ADDR", "127.0.0.1");
        params.set("REMOTE_ADDR", "127.0.0.1");
        params.set("REMOTE_PORT", event.remote_port.to_string());
        params.set("PATH_INFO", event.path.as_str());
        params.set("QUERY_STRING", event.query_string.as_str());
        // PHP-FPM will not read the stdin stream without a length, so an
        // explicit 0 matters for empty bodies.
        params.set("CONTENT_LENGTH", event.body.len().to_string());
        if let Some(content_type) = &event.content_type {
            params.set("CONTENT_TYPE", content_type.as_str());
        }

        params.set("LAMBDA_INVOCATION_CONTEXT", serde_json::to_string(context)?);
        let request_context = serde_json::to_string(&event.request_context)?;
        params.set("LAMBDA_REQUEST_CONTEXT", request_context.as_str());
        // Deprecated alias; applications still read it.
        params.set("LAMBDA_CONTEXT", request_context.as_str());

        for (name, values) in &event.headers {
            let key = format!("HTTP_{}", name.to_uppercase().replace('-', "_"));
            for value in values {
                // A repeated header keeps only its last value.
                params.set(&key, value.as_str());
            }
        }

        Ok(FcgiRequest {
            params: params.0,
            stdin: event.body.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::collections::HashMap;

    fn translator() -> RequestTranslator {
        RequestTranslator::new("/var/task/index.php")
    }

    fn event() -> HttpRequestEvent {
        HttpRequestEvent {
            method: "POST".to_string(),
            uri: "/submit?x=1".to_string(),
            path: "/submit".to_string(),
            query_string: "x=1".to_string(),
            protocol: "HTTP/1.1".to_string(),
            server_name: "example.com".to_string(),
            server_port: 443,
            remote_port: 39113,
            headers: HashMap::from([
                ("host".to_string(), vec!["example.com".to_string()]),
                (
                    "x-forwarded-for".to_string(),
                    vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                ),
            ]),
            content_type: Some("application/json".to_string()),
            body: br#"{"answer":42}"#.to_vec(),
            has_multi_header: false,
            request_context: json!({"stage": "prod"}),
        }
    }

    fn context() -> Context {
        Context {
            aws_request_id: "8476a536".to_string(),
            deadline_ms: 1_000,
            extra: Map::new(),
        }
    }

    fn param<'a>(request: &'a FcgiRequest, key: &str) -> Option<&'a str> {
        request
            .params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn translates_the_request_line_and_connection_constants() {
        let request = translator().translate(&event(), &context()).unwrap();
        assert_eq!(param(&request, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(param(&request, "REQUEST_URI"), Some("/submit?x=1"));
        assert_eq!(param(&request, "PATH_INFO"), Some("/submit"));
        assert_eq!(param(&request, "QUERY_STRING"), Some("x=1"));
        assert_eq!(param(&request, "SCRIPT_FILENAME"), Some("/var/task/index.php"));
        assert_eq!(param(&request, "SERVER_NAME"), Some("example.com"));
        assert_eq!(param(&request, "SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(param(&request, "SERVER_PORT"), Some("443"));
        assert_eq!(param(&request, "SERVER_ADDR"), Some("127.0.0.1"));
        assert_eq!(param(&request, "REMOTE_ADDR"), Some("127.0.0.1"));
        assert_eq!(param(&request, "REMOTE_PORT"), Some("39113"));
        assert_eq!(param(&request, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
    }

    #[test]
    fn body_rides_on_stdin_with_its_length_and_type() {
        let request = translator().translate(&event(), &context()).unwrap();
        assert_eq!(request.stdin, br#"{"answer":42}"#);
        assert_eq!(param(&request, "CONTENT_LENGTH"), Some("13"));
        assert_eq!(param(&request, "CONTENT_TYPE"), Some("application/json"));
    }

    #[test]
    fn an_empty_body_still_carries_an_explicit_zero_length() {
        let mut event = event();
        event.body = vec![];
        event.content_type = None;
        let request = translator().translate(&event, &context()).unwrap();
        assert_eq!(request.stdin, b"");
        assert_eq!(param(&request, "CONTENT_LENGTH"), Some("0"));
        assert_eq!(param(&request, "CONTENT_TYPE"), None);
    }

    #[test]
    fn headers_become_http_parameters_with_last_value_winning() {
        let request = translator().translate(&event(), &context()).unwrap();
        assert_eq!(param(&request, "HTTP_HOST"), Some("example.com"));
        assert_eq!(param(&request, "HTTP_X_FORWARDED_FOR"), Some("10.0.0.2"));
        // One parameter per header name, not per value.
        let forwarded = request
            .params
            .iter()
            .filter(|(name, _)| name == "HTTP_X_FORWARDED_FOR")
            .count();
        assert_eq!(forwarded, 1);
    }

    #[test]
    fn both_contexts_ride_along_as_json() {
        let request = translator().translate(&event(), &context()).unwrap();
        let invocation: serde_json::Value =
            serde_json::from_str(param(&request, "LAMBDA_INVOCATION_CONTEXT").unwrap()).unwrap();
        assert_eq!(invocation["awsRequestId"], "8476a536");
        assert_eq!(
            param(&request, "LAMBDA_REQUEST_CONTEXT"),
            Some(r#"{"stage":"prod"}"#)
        );
        assert_eq!(
            param(&request, "LAMBDA_CONTEXT"),
            param(&request, "LAMBDA_REQUEST_CONTEXT")
        );
    }
}
