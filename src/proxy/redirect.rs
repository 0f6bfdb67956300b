use anyhow::{Result, anyhow};
use http::StatusCode;

use crate::proxy::http::codec::ResponseHead;
use crate::proxy::request::ConnectTarget;

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Whether a redirect response should be followed on the client's behalf. A `limit` of zero
/// disables following; once `hop_count` reaches it the redirect is relayed as-is.
pub fn should_follow(status: StatusCode, hop_count: u32, limit: u32) -> bool {
    is_redirect(status) && hop_count < limit
}

/// Target of the next hop, taken from the response's `Location`.
pub fn next_target(current: &ConnectTarget, response: &ResponseHead) -> Result<ConnectTarget> {
    let location = response
        .headers
        .get("location")
        .ok_or_else(|| anyhow!("{} redirect without Location", response.status.as_u16()))?;
    current.resolve_location(location)
}
