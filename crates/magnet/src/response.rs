//! CGI-style response framing for failures the host reports itself.
//!
//! Successful scripts write their own headers through `print`, so the host
//! only frames resolution and compile failures.

use std::fmt;
use std::io::{self, Write};

/// Status classes the host can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 200, used for compile diagnostics.
    Ok,
    /// 400, missing path or a directory.
    BadRequest,
    /// 403, unreadable script.
    Forbidden,
    /// 404, no such script.
    NotFound,
    /// 503, transient failure.
    ServiceUnavailable,
}

impl Status {
    /// Numeric status code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Reason phrase.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Write a status-only response: headers followed by the status line as body.
///
/// # Errors
///
/// Returns any error from the underlying writer.
pub fn write_status(out: &mut dyn Write, status: Status) -> io::Result<()> {
    write!(
        out,
        "Content-Type: text/html\r\nStatus: {status}\r\n\r\n{status}\r\n"
    )
}

/// Write a compile diagnostic as a 200 page.
///
/// # Errors
///
/// Returns any error from the underlying writer.
pub fn write_compile_error(out: &mut dyn Write, diagnostic: &str) -> io::Result<()> {
    write!(
        out,
        "Content-Type: text/html\r\nStatus: {}\r\n\r\n{diagnostic}\r\n",
        Status::Ok
    )
}
