#![allow(dead_code)]

mod harness;
mod http_utils;
mod logging;
mod net;
mod origin;
mod proxy_client;

pub use harness::{ProxyHarness, ProxyHarnessBuilder, ServiceDef};
pub use http_utils::{RawResponse, read_response, read_until_double_crlf};
pub use logging::LogCapture;
pub use net::{find_free_port, wait_for_listener};
pub use origin::{OriginRequest, Reply, TestOrigin, http_response, read_origin_request};
pub use proxy_client::ProxyClient;
