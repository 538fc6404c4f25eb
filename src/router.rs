//! Minimal HTTP/1.1 request router.
//!
//! The router sees one buffered request at a time and decides, in order:
//!
//! 1. whether the request asks for a registered upgrade scheme (an
//!    `Upgrade: <scheme>` marker anywhere in the request),
//! 2. whether it is an operating system's captive-portal probe, answered with
//!    a redirect to the portal site,
//! 3. which `GET` route serves it,
//! 4. otherwise `404 Not Found`.
//!
//! Every non-upgrade response closes the connection.
//!
//! ```rust
//! use wsportal::router::{Dispatch, Response, Router};
//!
//! let router = Router::new()
//!     .route("/", |_req| Response::html("<h1>hello</h1>"))
//!     .upgrade_scheme("websocket");
//!
//! match router.dispatch("GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n\r\n") {
//!     Dispatch::Upgrade(scheme) => assert_eq!(scheme, "websocket"),
//!     Dispatch::Respond(_) => unreachable!(),
//! }
//! ```
use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, StatusCode};
use nom::{
    bytes::complete::{tag, take_till, take_till1},
    character::complete::space1,
    combinator::opt,
    sequence::preceded,
    IResult, Parser,
};

const MAX_METHOD_LEN: usize = 7;
const MAX_PATH_LEN: usize = 255;
const MAX_QUERY_LEN: usize = 511;

/// Paths operating systems probe to detect a captive portal.
pub const CAPTIVE_PROBES: [&str; 4] = [
    "/generate_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/redirect",
];

/// The request line of an HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    /// Path without the query string.
    pub path: &'a str,
    /// Raw query string, without the leading `?`.
    pub query: Option<&'a str>,
    pub version: Option<&'a str>,
}

impl<'a> Request<'a> {
    /// Parses the first line of `request`.
    ///
    /// Returns `None` for malformed lines and for methods, paths or query
    /// strings longer than 7, 255 and 511 bytes.
    pub fn parse(request: &'a str) -> Option<Self> {
        let line = request.split("\r\n").next()?;
        let (_, (method, path, query, version)) = request_line(line).ok()?;

        if method.len() > MAX_METHOD_LEN
            || path.len() > MAX_PATH_LEN
            || query.is_some_and(|query| query.len() > MAX_QUERY_LEN)
        {
            return None;
        }

        Some(Self {
            method,
            path,
            query,
            version,
        })
    }

    /// Whether this is a `GET` request.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

type RequestLine<'a> = (&'a str, &'a str, Option<&'a str>, Option<&'a str>);

fn request_line(input: &str) -> IResult<&str, RequestLine<'_>> {
    // GET /path?query HTTP/1.1
    (
        take_till1(|c: char| c == ' '),
        preceded(space1, take_till1(|c: char| c == ' ' || c == '?')),
        opt(preceded(tag("?"), take_till(|c: char| c == ' '))),
        opt(preceded(space1, take_till1(|c: char| c == ' '))),
    )
        .parse(input)
}

/// An HTTP response that closes the connection once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl Response {
    /// An empty response with `Connection: close`.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: vec![("Connection", "close".to_string())],
            body: Bytes::new(),
        }
    }

    /// `200 OK` with an HTML body and caching disabled.
    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK)
            .header("Content-Type", "text/html; charset=UTF-8")
            .header("Cache-Control", "no-cache, no-store, must-revalidate")
            .body(body)
    }

    /// `302 Found` pointing at `location`, never cached.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(StatusCode::FOUND)
            .header("Location", location)
            .header("Cache-Control", "no-cache, no-store, must-revalidate")
    }

    /// `404 Not Found` with an empty body.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    /// `400 Bad Request` with an empty body.
    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    /// Adds a header.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Replaces the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes status line, headers, `Content-Length` and body.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        out.put_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            out.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// Handler serving one `GET` route.
pub type RouteHandler = Box<dyn Fn(&Request<'_>) -> Response + Send + Sync>;

/// Outcome of routing one request.
#[derive(Debug)]
pub enum Dispatch<'r> {
    /// Hand the connection to the protocol registered for this scheme.
    Upgrade(&'r str),
    /// Write this response, then close.
    Respond(Response),
}

/// Route table plus upgrade schemes.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, RouteHandler>,
    /// `(marker, scheme)`, matched in registration order.
    schemes: Vec<(String, String)>,
    captive_site: Option<String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `GET path` with `handler`. A later registration replaces an
    /// earlier one for the same path.
    pub fn route<F>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request<'_>) -> Response + Send + Sync + 'static,
    {
        self.routes.insert(path.into(), Box::new(handler));
        self
    }

    /// Registers an upgrade scheme, matched as `Upgrade: <scheme>`.
    pub fn upgrade_scheme(mut self, scheme: impl Into<String>) -> Self {
        let scheme = scheme.into();
        self.schemes.push((format!("Upgrade: {}", scheme), scheme));
        self
    }

    /// Answers captive-portal probes with a redirect to `http://<site>/`.
    pub fn captive_portal(mut self, site: impl Into<String>) -> Self {
        self.captive_site = Some(site.into());
        self
    }

    /// Whether `scheme` was registered.
    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|(_, s)| s == scheme)
    }

    /// Routes one buffered request.
    pub fn dispatch<'r>(&'r self, request: &str) -> Dispatch<'r> {
        if let Some((_, scheme)) = self
            .schemes
            .iter()
            .find(|(marker, _)| request.contains(marker.as_str()))
        {
            return Dispatch::Upgrade(scheme);
        }

        let Some(req) = Request::parse(request) else {
            #[cfg(feature = "logging")]
            log::debug!("malformed request line");
            return Dispatch::Respond(Response::not_found());
        };

        if let Some(site) = &self.captive_site {
            if req.is_get() && CAPTIVE_PROBES.contains(&req.path) {
                #[cfg(feature = "logging")]
                log::debug!("captive probe {} redirected to {}", req.path, site);
                return Dispatch::Respond(Response::redirect(format!("http://{}/", site)));
            }
        }

        if req.is_get() {
            if let Some(handler) = self.routes.get(req.path) {
                return Dispatch::Respond(handler(&req));
            }
        }

        #[cfg(feature = "logging")]
        log::debug!("no route for {} {}", req.method, req.path);
        Dispatch::Respond(Response::not_found())
    }
}
