use ab_domain::error::Error;

/// Map a reqwest error into the shared error type, preserving the
/// timeout/connect distinction the retry layer cares about.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}
