#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;

use proxygate::config::{Scheme, TransportOverride};
use proxygate::proxy::request::ConnectTarget;

fuzz_target!(|data: &[u8]| {
    let location = String::from_utf8_lossy(data);
    let current = ConnectTarget {
        scheme: Scheme::Http,
        host: Arc::from("origin.test"),
        port: 8080,
        path_and_query: "/base/page?x=1".to_string(),
        transport: Some(TransportOverride {
            host: Arc::from("127.0.0.1"),
            port: 9000,
        }),
        tls: false,
    };

    if let Ok(next) = current.resolve_location(location.as_ref()) {
        let _ = next.uri();
        let _ = next.origin_key();
    }
});
