// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! # Mutations Utility Module
//!
//! Constructors for the `ProcessingResponse` shapes the processor emits:
//! empty phase acknowledgements, the buffered-body mode override, header
//! mutations on the response body, and the immediate responses used for
//! cache hits and safety blocks.
//!
//! These functions abstract away the nesting of the Envoy protobuf message
//! structures so the processing logic reads as intent rather than plumbing.

use crate::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use crate::envoy::extensions::filters::http::ext_proc::v3::{
    processing_mode::{BodySendMode, HeaderSendMode},
    ProcessingMode,
};
use crate::envoy::r#type::v3::{HttpStatus, StatusCode};
use crate::envoy::service::ext_proc::v3::{
    processing_response::Response as ProcessingResponseType, BodyResponse, CommonResponse,
    HeaderMutation, HeadersResponse, ImmediateResponse, ProcessingResponse,
};
use serde_json::json;

/// Creates an empty RequestHeaders acknowledgement.
pub fn request_headers_ack() -> ProcessingResponse {
    ProcessingResponse {
        response: Some(ProcessingResponseType::RequestHeaders(HeadersResponse {
            response: None,
        })),
        ..Default::default()
    }
}

/// Creates an empty RequestBody acknowledgement (pass-through).
pub fn request_body_ack() -> ProcessingResponse {
    ProcessingResponse {
        response: Some(ProcessingResponseType::RequestBody(BodyResponse {
            response: None,
        })),
        ..Default::default()
    }
}

/// Creates an empty ResponseBody acknowledgement (pass-through).
pub fn response_body_ack() -> ProcessingResponse {
    ProcessingResponse {
        response: Some(ProcessingResponseType::ResponseBody(BodyResponse {
            response: None,
        })),
        ..Default::default()
    }
}

/// Creates a ResponseHeaders acknowledgement carrying a mode override that
/// instructs Envoy to skip further response headers and deliver the entire
/// upstream body as one buffered message.
///
/// Every feature on the response path (safety check, caching, token usage)
/// needs the whole body exactly once, so buffering is requested here
/// unconditionally.
pub fn buffered_response_headers_ack() -> ProcessingResponse {
    ProcessingResponse {
        response: Some(ProcessingResponseType::ResponseHeaders(HeadersResponse {
            response: None,
        })),
        mode_override: Some(ProcessingMode {
            response_header_mode: HeaderSendMode::Skip as i32,
            response_body_mode: BodySendMode::Buffered as i32,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Creates a ResponseBody acknowledgement whose header mutation sets the
/// given headers while leaving the body untouched.
pub fn response_body_headers_ack(set_headers: Vec<HeaderValueOption>) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(ProcessingResponseType::ResponseBody(BodyResponse {
            response: Some(CommonResponse {
                header_mutation: Some(HeaderMutation {
                    set_headers,
                    remove_headers: Vec::new(),
                }),
                ..Default::default()
            }),
        })),
        ..Default::default()
    }
}

/// Creates an immediate 403 response with a JSON error body, short-circuiting
/// the upstream.
pub fn forbidden_response(message: &str) -> ProcessingResponse {
    immediate_response(
        StatusCode::Forbidden,
        json!({ "error": message }).to_string().into_bytes(),
        vec![content_type_json()],
    )
}

/// Creates an immediate 200 response replaying cached body bytes, optionally
/// decorated with token-usage headers extracted from those bytes.
pub fn cached_response(body: Vec<u8>, token_headers: Vec<HeaderValueOption>) -> ProcessingResponse {
    immediate_response(StatusCode::Ok, body, token_headers)
}

fn immediate_response(
    status: StatusCode,
    body: Vec<u8>,
    set_headers: Vec<HeaderValueOption>,
) -> ProcessingResponse {
    let headers = if set_headers.is_empty() {
        None
    } else {
        Some(HeaderMutation {
            set_headers,
            remove_headers: Vec::new(),
        })
    };

    ProcessingResponse {
        response: Some(ProcessingResponseType::ImmediateResponse(
            ImmediateResponse {
                status: Some(HttpStatus {
                    code: status as i32,
                }),
                headers,
                body,
                grpc_status: None,
                details: String::new(),
            },
        )),
        ..Default::default()
    }
}

fn content_type_json() -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: "Content-Type".to_string(),
            raw_value: b"application/json".to_vec(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    //! Tests for the mutation constructors, verifying the structure of each
    //! Envoy processing response.

    use super::*;
    use crate::envoy::service::ext_proc::v3::processing_response::Response as ProcessingResponseVariant;

    #[test]
    fn test_request_headers_ack_is_empty() {
        let response = request_headers_ack();
        if let Some(ProcessingResponseVariant::RequestHeaders(headers_response)) = response.response
        {
            assert!(headers_response.response.is_none());
        } else {
            panic!("Expected RequestHeaders response");
        }
        assert!(response.mode_override.is_none());
    }

    #[test]
    fn test_body_acks_carry_no_mutations() {
        let request_ack = request_body_ack();
        if let Some(ProcessingResponseVariant::RequestBody(body_response)) = request_ack.response {
            assert!(body_response.response.is_none());
        } else {
            panic!("Expected RequestBody response");
        }

        let response_ack = response_body_ack();
        if let Some(ProcessingResponseVariant::ResponseBody(body_response)) = response_ack.response
        {
            assert!(body_response.response.is_none());
        } else {
            panic!("Expected ResponseBody response");
        }
    }

    #[test]
    fn test_buffered_response_headers_ack_mode_override() {
        let response = buffered_response_headers_ack();

        if let Some(ProcessingResponseVariant::ResponseHeaders(headers_response)) =
            &response.response
        {
            assert!(headers_response.response.is_none());
        } else {
            panic!("Expected ResponseHeaders response");
        }

        let mode = response.mode_override.expect("expected a mode override");
        assert_eq!(mode.response_header_mode(), HeaderSendMode::Skip);
        assert_eq!(mode.response_body_mode(), BodySendMode::Buffered);
    }

    #[test]
    fn test_response_body_headers_ack() {
        let header = HeaderValueOption {
            header: Some(HeaderValue {
                key: "x-test".to_string(),
                raw_value: b"1".to_vec(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = response_body_headers_ack(vec![header]);

        if let Some(ProcessingResponseVariant::ResponseBody(body_response)) = response.response {
            let common = body_response.response.expect("expected a common response");
            let mutation = common.header_mutation.expect("expected a header mutation");
            assert_eq!(mutation.set_headers.len(), 1);
            assert_eq!(
                mutation.set_headers[0].header.as_ref().unwrap().key,
                "x-test"
            );
            assert!(common.body_mutation.is_none());
        } else {
            panic!("Expected ResponseBody response");
        }
    }

    #[test]
    fn test_forbidden_response() {
        let response = forbidden_response("Prompt blocked by content policy");

        if let Some(ProcessingResponseVariant::ImmediateResponse(immediate)) = response.response {
            assert_eq!(immediate.status.as_ref().unwrap().code, 403);
            assert_eq!(
                String::from_utf8_lossy(&immediate.body),
                r#"{"error":"Prompt blocked by content policy"}"#
            );

            let headers = immediate.headers.expect("expected headers");
            assert_eq!(headers.set_headers.len(), 1);
            let header = headers.set_headers[0].header.as_ref().unwrap();
            assert_eq!(header.key, "Content-Type");
            assert_eq!(String::from_utf8_lossy(&header.raw_value), "application/json");
        } else {
            panic!("Expected ImmediateResponse");
        }
    }

    #[test]
    fn test_cached_response_without_headers() {
        let body = br#"{"choices":[{"text":"hi"}]}"#.to_vec();
        let response = cached_response(body.clone(), vec![]);

        if let Some(ProcessingResponseVariant::ImmediateResponse(immediate)) = response.response {
            assert_eq!(immediate.status.as_ref().unwrap().code, 200);
            assert_eq!(immediate.body, body);
            assert!(immediate.headers.is_none());
        } else {
            panic!("Expected ImmediateResponse");
        }
    }

    #[test]
    fn test_cached_response_with_headers() {
        let header = HeaderValueOption {
            header: Some(HeaderValue {
                key: "x-kuadrant-openai-total-tokens".to_string(),
                raw_value: b"3".to_vec(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = cached_response(b"cached".to_vec(), vec![header]);

        if let Some(ProcessingResponseVariant::ImmediateResponse(immediate)) = response.response {
            let headers = immediate.headers.expect("expected headers");
            assert_eq!(headers.set_headers.len(), 1);
        } else {
            panic!("Expected ImmediateResponse");
        }
    }
}
