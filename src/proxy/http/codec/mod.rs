mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::{FramingHeaders, HeaderLine, HeaderParser, HeaderSet};
pub(crate) use line::{read_line_with_timeout, trim_line_ending};
pub(crate) use request::{RequestHead, read_request_head, starts_request_line};
pub(crate) use response::{ResponseHead, encode_response_head, read_response_head};
