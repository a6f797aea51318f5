//! Signaling URL construction

use crate::config::ConnectOptions;
use crate::error::{Error, Result};
use crate::state::ReconnectMode;
use url::Url;

const SDK_NAME: &str = "rust";

/// Build the socket URL (`.../rtc`) or the HTTP validation URL (`.../validate`)
///
/// Accepts base URLs with any of the ws/wss/http/https schemes and with or
/// without a trailing `rtc`/`validate` segment.
pub fn build_url(
    base: &str,
    token: &str,
    options: &ConnectOptions,
    adaptive_stream: bool,
    reconnect_mode: Option<ReconnectMode>,
    validate: bool,
) -> Result<Url> {
    let mut url = Url::parse(base)?;

    let secure = match url.scheme() {
        "wss" | "https" => true,
        "ws" | "http" => false,
        other => {
            return Err(Error::Protocol(format!("unsupported url scheme: {}", other)));
        }
    };
    let scheme = match (validate, secure) {
        (true, true) => "https",
        (true, false) => "http",
        (false, true) => "wss",
        (false, false) => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Protocol(format!("cannot switch url scheme to {}", scheme)))?;

    let mut segments: Vec<String> = url
        .path_segments()
        .map(|parts| {
            parts
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if matches!(segments.last().map(String::as_str), Some("rtc") | Some("validate")) {
        segments.pop();
    }
    segments.push(if validate { "validate" } else { "rtc" }.to_string());
    url.set_path(&format!("/{}", segments.join("/")));

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query
            .append_pair("access_token", token)
            .append_pair("protocol", &options.protocol_version.to_string())
            .append_pair("sdk", SDK_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("os", std::env::consts::OS)
            .append_pair(
                "reconnect",
                if reconnect_mode == Some(ReconnectMode::Quick) { "1" } else { "0" },
            )
            .append_pair("auto_subscribe", bool_flag(options.auto_subscribe))
            .append_pair("adaptive_stream", bool_flag(adaptive_stream));
        if let Some(identity) = &options.publish_only {
            query.append_pair("publish", identity);
        }
    }

    Ok(url)
}

fn bool_flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_socket_url() {
        let url = build_url(
            "wss://sfu.example.com",
            "tok",
            &ConnectOptions::default(),
            true,
            None,
            false,
        )
        .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/rtc");
        assert_eq!(query(&url, "access_token").as_deref(), Some("tok"));
        assert_eq!(query(&url, "protocol").as_deref(), Some("8"));
        assert_eq!(query(&url, "reconnect").as_deref(), Some("0"));
        assert_eq!(query(&url, "auto_subscribe").as_deref(), Some("1"));
        assert_eq!(query(&url, "adaptive_stream").as_deref(), Some("1"));
        assert_eq!(query(&url, "publish"), None);
    }

    #[test]
    fn test_validate_url_switches_scheme_and_path() {
        let url = build_url(
            "ws://localhost:7880/base/rtc",
            "tok",
            &ConnectOptions::default(),
            false,
            None,
            true,
        )
        .unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.path(), "/base/validate");

        let secure = build_url(
            "https://sfu.example.com/validate",
            "tok",
            &ConnectOptions::default(),
            false,
            None,
            false,
        )
        .unwrap();
        assert_eq!(secure.scheme(), "wss");
        assert_eq!(secure.path(), "/rtc");
    }

    #[test]
    fn test_reconnect_flag_only_for_quick() {
        let opts = ConnectOptions {
            publish_only: Some("bot".to_string()),
            ..Default::default()
        };
        let quick = build_url("wss://h", "t", &opts, false, Some(ReconnectMode::Quick), false)
            .unwrap();
        assert_eq!(query(&quick, "reconnect").as_deref(), Some("1"));
        assert_eq!(query(&quick, "publish").as_deref(), Some("bot"));

        let full = build_url("wss://h", "t", &opts, false, Some(ReconnectMode::Full), false)
            .unwrap();
        assert_eq!(query(&full, "reconnect").as_deref(), Some("0"));
    }

    #[test]
    fn test_rejects_other_schemes() {
        let err = build_url(
            "ftp://h",
            "t",
            &ConnectOptions::default(),
            false,
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
