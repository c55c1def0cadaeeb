// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The HTTP gateway.
//!
//! `GET /{128-hex-key}` fetches and decrypts a block; `POST /upload` takes
//! a file and answers with its retrieval links. Keys also come in a base58
//! short form that redirects to the hex form. The gateway imposes the only
//! timeouts in the system: the overlay itself waits on tunnel closure.

use crate::node::sniff_content_type;
use bytes::Bytes;
use hyper::{
    header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LOCATION},
    service::Service,
    Body, Method, Request, Response, Server, StatusCode,
};
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::task::JoinHandle;
use weft_networking::{Error as NetworkError, Network};
use weft_protocol::{DataKey, NodeId};

/// How long a retrieval may take before the client gets a 408.
const GET_TIMEOUT: Duration = Duration::from_secs(15);
/// How long an upload may take before the client gets a 408.
const STORE_TIMEOUT: Duration = Duration::from_secs(30);

const UPLOAD_PAGE: &str = "<html><head><title>Weft Upload</title></head><body>\
<p>Select the file to upload below:</p>\
<form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">\
<input type=\"file\" name=\"fileToUpload\" id=\"fileToUpload\"/><br/>\
<input type=\"submit\" value=\"Upload File\" name=\"submit\"/>\
</form></body></html>";

/// A running gateway server.
pub struct GatewayHandle {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Bind and serve the gateway. Returns once the listener is up; the
/// server itself runs on its own task.
pub async fn serve(network: Network, addr: SocketAddr) -> hyper::Result<GatewayHandle> {
    let server = Server::try_bind(&addr)?.serve(MakeGatewayService { network });
    let addr = server.local_addr();
    info!("Gateway listening on http://{addr}/");
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("Gateway server error: {err}");
        }
    });
    Ok(GatewayHandle { addr, handle })
}

struct MakeGatewayService {
    network: Network,
}

impl<T> Service<T> for MakeGatewayService {
    type Response = GatewayService;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: T) -> Self::Future {
        let network = self.network.clone();
        Box::pin(async move { Ok(GatewayService { network }) })
    }
}

struct GatewayService {
    network: Network,
}

impl Service<Request<Body>> for GatewayService {
    type Response = Response<Body>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let network = self.network.clone();
        Box::pin(async move { Ok(handle_request(network, req).await) })
    }
}

async fn handle_request(network: Network, req: Request<Body>) -> Response<Body> {
    match *req.method() {
        Method::GET => handle_get(network, req).await,
        Method::POST => handle_post(network, req).await,
        _ => status_page(StatusCode::BAD_REQUEST),
    }
}

async fn handle_get(network: Network, req: Request<Body>) -> Response<Body> {
    let rpath = req.uri().path().trim_matches('/').to_string();

    if rpath == "upload" {
        return upload_page(&req);
    }

    if let Some(short) = rpath.strip_prefix("get/") {
        return match DataKey::from_base58(short) {
            Ok(key) => {
                let hex_key = key.to_hex();
                let body = format!("<a href=\"/{hex_key}\">{hex_key}</a>\n{hex_key}");
                response_builder(StatusCode::MOVED_PERMANENTLY)
                    .header(LOCATION, format!("/{hex_key}"))
                    .header(CONTENT_TYPE, "text/html")
                    .header(CONTENT_LENGTH, body.len())
                    .body(Body::from(body))
                    .unwrap_or_else(|_| status_page(StatusCode::INTERNAL_SERVER_ERROR))
            }
            Err(_) => status_page(StatusCode::BAD_REQUEST),
        };
    }

    if req
        .headers()
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(rpath.as_str())
    {
        return response_builder(StatusCode::NOT_MODIFIED)
            .header(ETAG, rpath)
            .body(Body::empty())
            .unwrap_or_else(|_| status_page(StatusCode::INTERNAL_SERVER_ERROR));
    }

    if rpath.len() != 2 * weft_protocol::NODE_ID_BYTES {
        warn!("Invalid request: [{rpath}]");
        return status_page(StatusCode::BAD_REQUEST);
    }
    let Ok(data_key) = DataKey::from_hex(&rpath) else {
        warn!("Invalid request: [{rpath}]");
        return status_page(StatusCode::BAD_REQUEST);
    };

    match tokio::time::timeout(GET_TIMEOUT, network.get_data(&data_key)).await {
        Err(_) => status_page(StatusCode::REQUEST_TIMEOUT),
        Ok(Err(NetworkError::NoConnectedPeers)) | Ok(Ok(None)) => {
            status_page(StatusCode::NOT_FOUND)
        }
        Ok(Err(err)) => {
            error!("Retrieval of [{rpath}] failed: {err:?}");
            status_page(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Ok(Ok(Some(data))) => response_builder(StatusCode::OK)
            .header(CONTENT_TYPE, sniff_content_type(&data))
            .header(CONTENT_LENGTH, data.len())
            .header(CACHE_CONTROL, "public")
            .header(ETAG, rpath)
            .body(Body::from(data))
            .unwrap_or_else(|_| status_page(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

async fn handle_post(network: Network, req: Request<Body>) -> Response<Body> {
    if req.uri().path().trim_matches('/') != "upload" {
        return status_page(StatusCode::BAD_REQUEST);
    }

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Ok(body) = hyper::body::to_bytes(req.into_body()).await else {
        return status_page(StatusCode::BAD_REQUEST);
    };

    let data = if content_type.starts_with("multipart/form-data") {
        match extract_multipart_file(&content_type, &body) {
            Some(file) => file,
            None => return status_page(StatusCode::BAD_REQUEST),
        }
    } else {
        body
    };
    if data.is_empty() {
        return status_page(StatusCode::BAD_REQUEST);
    }

    match tokio::time::timeout(STORE_TIMEOUT, network.store_data(data)).await {
        Err(_) => status_page(StatusCode::REQUEST_TIMEOUT),
        Ok(Err(err)) => {
            error!("Upload failed: {err:?}");
            status_page(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Ok(Ok(data_key)) => {
            let hex_key = data_key.to_hex();
            let body = format!(
                "<a href=\"/{hex_key}\">perma link</a>\n{hex_key}\n{}",
                data_key.to_base58()
            );
            response_builder(StatusCode::OK)
                .header(CONTENT_TYPE, "text/html")
                .header(CONTENT_LENGTH, body.len())
                .body(Body::from(body))
                .unwrap_or_else(|_| status_page(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn upload_page(req: &Request<Body>) -> Response<Body> {
    let content_id = NodeId::from_content(UPLOAD_PAGE.as_bytes()).to_hex();
    if req
        .headers()
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(content_id.as_str())
    {
        return response_builder(StatusCode::NOT_MODIFIED)
            .header(ETAG, content_id)
            .body(Body::empty())
            .unwrap_or_else(|_| status_page(StatusCode::INTERNAL_SERVER_ERROR));
    }
    response_builder(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html")
        .header(CONTENT_LENGTH, UPLOAD_PAGE.len())
        .header(CACHE_CONTROL, "public")
        .header(ETAG, content_id)
        .body(Body::from(UPLOAD_PAGE))
        .unwrap_or_else(|_| status_page(StatusCode::INTERNAL_SERVER_ERROR))
}

fn response_builder(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder().status(status)
}

fn status_page(status: StatusCode) -> Response<Body> {
    let message = format!(
        "{} {}.",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html")
        .header(CONTENT_LENGTH, message.len())
        .body(Body::from(message))
        .unwrap_or_default()
}

/// Pull the `fileToUpload` part out of a multipart body. The gateway only
/// ever needs this one field, so a boundary split beats a parser
/// dependency.
fn extract_multipart_file(content_type: &str, body: &[u8]) -> Option<Bytes> {
    let boundary = content_type
        .split("boundary=")
        .nth(1)?
        .split(';')
        .next()?
        .trim_matches('"');
    let delimiter = format!("--{boundary}");

    for part in split_bytes(body, delimiter.as_bytes()) {
        let headers_end = find_subslice(part, b"\r\n\r\n")?;
        let headers = String::from_utf8_lossy(&part[..headers_end]);
        if !headers.contains("name=\"fileToUpload\"") {
            continue;
        }
        let mut content = &part[headers_end + 4..];
        // The trailing CRLF belongs to the boundary, not the file.
        if content.ends_with(b"\r\n") {
            content = &content[..content.len() - 2];
        }
        return Some(Bytes::copy_from_slice(content));
    }
    None
}

fn split_bytes<'a>(haystack: &'a [u8], delimiter: &'a [u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = haystack;
    while let Some(at) = find_subslice(rest, delimiter) {
        parts.push(&rest[..at]);
        rest = &rest[at + delimiter.len()..];
    }
    parts.push(rest);
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_file_is_extracted() {
        let boundary = "----WebKitFormBoundaryX";
        let content_type = format!("multipart/form-data; boundary={boundary}");
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"submit\"\r\n\r\n\
             Upload File\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"fileToUpload\"; filename=\"x.bin\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             file contents here\r\n\
             --{boundary}--\r\n"
        );

        let file = extract_multipart_file(&content_type, body.as_bytes())
            .expect("the file part should be found");
        assert_eq!(file.as_ref(), b"file contents here");
    }

    #[test]
    fn multipart_without_the_file_field_is_rejected() {
        let content_type = "multipart/form-data; boundary=b";
        let body = b"--b\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--b--\r\n";
        assert!(extract_multipart_file(content_type, body).is_none());
    }

    #[test]
    fn binary_file_bodies_survive_extraction() {
        let boundary = "b";
        let content_type = format!("multipart/form-data; boundary={boundary}");
        let mut body = Vec::new();
        body.extend_from_slice(b"--b\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"fileToUpload\"\r\n\r\n");
        let payload = [0xffu8, 0xd8, 0x00, 0x0d, 0x0a, 0x01];
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--b--\r\n");

        let file = extract_multipart_file(&content_type, &body)
            .expect("the file part should be found");
        assert_eq!(file.as_ref(), &payload);
    }
}
