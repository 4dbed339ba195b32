//! Constants for the download module (timeouts, validation thresholds).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default whole-request timeout per attempt (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default minimum accepted body size in bytes.
pub const DEFAULT_MIN_SIZE_BYTES: u64 = 1024;

/// Magic prefix of a PDF document.
pub const PDF_MAGIC: &[u8] = b"%PDF";

/// Bytes inspected for magic and error-page markers.
pub const SNIFF_BYTES: usize = 4096;

/// Longest response-body excerpt kept in an HTTP error message.
pub const MAX_ERROR_BODY_CHARS: usize = 200;

/// Default User-Agent for fetch requests.
pub const DEFAULT_USER_AGENT: &str = concat!("collector/", env!("CARGO_PKG_VERSION"));

/// Lowercase markers that reveal an error page served with status 200.
pub const ERROR_PAGE_MARKERS: &[&str] = &[
    "<!doctype html",
    "<html",
    "<head>",
    "<body",
    "404 not found",
    "page not found",
    "access denied",
    "forbidden",
    "captcha",
    "rate limit exceeded",
];
