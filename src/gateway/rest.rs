//! The REST side-channel: liveness, track resolution and blob decoding.

use crate::protocol::track::TrackInfo;
use crate::sources;

use serde_json::json;

use tracing::debug;

use super::{Gateway, HttpRequest};

/// A minimal HTTP response. Everything this server answers is JSON.
pub(crate) struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub body: String,
}

impl Response {
    pub fn json(status: u16, reason: &'static str, body: String) -> Response {
        Response {
            status,
            reason,
            body,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason,
            self.body.len(),
            self.body,
        )
        .into_bytes()
    }
}

/// Routes a REST request.
pub(crate) async fn handle(gateway: &Gateway, req: &HttpRequest) -> Response {
    if !gateway.config.authorized(req.header("authorization")) {
        return Response::json(401, "Unauthorized", String::new());
    }

    debug!("{} {}", req.method, req.path);

    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/") => Response::json(200, "OK", json!("Ok boomer.").to_string()),
        ("GET", "/loadtracks") => load_tracks(gateway, req).await,
        ("GET", "/decodetracks") => decode_tracks(req),
        _ => Response::json(404, "Not Found", String::new()),
    }
}

async fn load_tracks(gateway: &Gateway, req: &HttpRequest) -> Response {
    let Some(identifier) = req.query_value("identifier") else {
        return Response::json(400, "Bad Request", String::new());
    };

    let result =
        sources::load_tracks(&gateway.http, &gateway.config.lavalink.server, identifier).await;

    match serde_json::to_string(&result) {
        Ok(body) => Response::json(200, "OK", body),
        Err(_) => Response::json(500, "Internal Server Error", String::new()),
    }
}

fn decode_tracks(req: &HttpRequest) -> Response {
    let blobs: Vec<&str> = req.query_values("track").collect();

    if blobs.is_empty() {
        return Response::json(400, "Bad Request", String::new());
    }

    // one value answers with the bare info; repeats answer with an array
    // preserving order
    let body = if blobs.len() == 1 {
        match TrackInfo::decode(blobs[0]) {
            Ok(info) => serde_json::to_string(&info),
            Err(_) => return Response::json(400, "Bad Request", String::new()),
        }
    } else {
        let mut decoded = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match TrackInfo::decode(blob) {
                Ok(info) => decoded.push(json!({ "track": blob, "info": info })),
                Err(_) => return Response::json(400, "Bad Request", String::new()),
            }
        }

        serde_json::to_string(&decoded)
    };

    match body {
        Ok(body) => Response::json(200, "OK", body),
        Err(_) => Response::json(500, "Internal Server Error", String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::TrackInfo;

    fn info(title: &str) -> TrackInfo {
        TrackInfo {
            identifier: String::from("id"),
            is_seekable: true,
            author: String::from("a"),
            length: 1000,
            is_stream: false,
            position: 0,
            title: title.to_owned(),
            uri: None,
            source: String::from("http"),
        }
    }

    fn get(path_and_query: &str) -> HttpRequest {
        HttpRequest::parse_for_test("GET", path_and_query)
    }

    #[test]
    fn decode_single_returns_bare_info() {
        let blob = info("one").encode();
        let req = get(&format!("/decodetracks?track={}", urlencoding::encode(&blob)));

        let res = decode_tracks(&req);
        assert_eq!(res.status, 200);

        let parsed: TrackInfo = serde_json::from_str(&res.body).unwrap();
        assert_eq!(parsed.title, "one");
    }

    #[test]
    fn decode_many_preserves_order() {
        let first = info("one").encode();
        let second = info("two").encode();
        let req = get(&format!(
            "/decodetracks?track={}&track={}",
            urlencoding::encode(&first),
            urlencoding::encode(&second),
        ));

        let res = decode_tracks(&req);
        assert_eq!(res.status, 200);

        let parsed: serde_json::Value = serde_json::from_str(&res.body).unwrap();
        let list = parsed.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["info"]["title"], "one");
        assert_eq!(list[1]["info"]["title"], "two");
        assert_eq!(list[0]["track"], first);
    }

    #[test]
    fn decode_bad_blob_is_rejected() {
        let req = get("/decodetracks?track=garbage");

        assert_eq!(decode_tracks(&req).status, 400);
    }

    #[test]
    fn response_bytes_shape() {
        let res = Response::json(200, "OK", String::from("{}"));
        let text = String::from_utf8(res.to_bytes()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }
}
