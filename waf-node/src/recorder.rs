use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Buffered copy of the downstream response.
///
/// Phases 3 and 4 evaluate against the buffer; afterwards the response is
/// either replayed to the client verbatim or discarded in favor of the
/// custom block response.
#[derive(Debug)]
pub struct ResponseRecorder {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ResponseRecorder {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Response body as text for phase-4 matching
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Replay the captured response: headers, then status, then body.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_preserves_everything() {
        let mut headers = HeaderMap::new();
        headers.insert("x-served-by", "origin-3".parse().unwrap());

        let recorder = ResponseRecorder::new(
            StatusCode::CREATED,
            headers,
            Bytes::from_static(b"created"),
        );
        assert_eq!(recorder.body_string(), "created");

        let response = recorder.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-served-by"], "origin-3");
    }

    #[test]
    fn test_body_string_is_lossy() {
        let recorder = ResponseRecorder::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(&[0x68, 0x69, 0xff]),
        );
        assert!(recorder.body_string().starts_with("hi"));
    }
}
