use url::Url;

use crate::TransportError;

/// Primary socket endpoint for a session.
///
/// An explicit address is used as given apart from the scheme; otherwise the
/// base gets `/ws/<session_id>` appended. `http(s)` becomes `ws(s)`.
pub fn socket_url(
    base: &str,
    session_id: &str,
    explicit: Option<&str>,
) -> Result<Url, TransportError> {
    if let Some(explicit) = explicit.filter(|value| !value.trim().is_empty()) {
        let mut url = parse(explicit)?;
        rewrite_scheme(&mut url, SchemeFamily::Socket)?;
        return Ok(url);
    }
    let mut url = parse(base)?;
    rewrite_scheme(&mut url, SchemeFamily::Socket)?;
    push_segments(&mut url, &["ws", session_id])?;
    Ok(url)
}

/// Push-stream endpoint for a session: the socket address on the HTTP scheme
/// with a `/stream` suffix.
pub fn stream_url(
    base: &str,
    session_id: &str,
    explicit: Option<&str>,
) -> Result<Url, TransportError> {
    if let Some(explicit) = explicit.filter(|value| !value.trim().is_empty()) {
        let mut url = parse(explicit)?;
        rewrite_scheme(&mut url, SchemeFamily::Http)?;
        if !url.path().trim_end_matches('/').ends_with("/stream") {
            push_segments(&mut url, &["stream"])?;
        }
        return Ok(url);
    }
    let mut url = parse(base)?;
    rewrite_scheme(&mut url, SchemeFamily::Http)?;
    push_segments(&mut url, &["ws", session_id, "stream"])?;
    Ok(url)
}

#[derive(Clone, Copy)]
enum SchemeFamily {
    Socket,
    Http,
}

fn parse(raw: &str) -> Result<Url, TransportError> {
    Url::parse(raw.trim()).map_err(|err| TransportError::Url(format!("{raw}: {err}")))
}

fn rewrite_scheme(url: &mut Url, family: SchemeFamily) -> Result<(), TransportError> {
    let target = match (family, url.scheme()) {
        (SchemeFamily::Socket, "http") => "ws",
        (SchemeFamily::Socket, "https") => "wss",
        (SchemeFamily::Http, "ws") => "http",
        (SchemeFamily::Http, "wss") => "https",
        (SchemeFamily::Socket, "ws" | "wss") | (SchemeFamily::Http, "http" | "https") => {
            return Ok(())
        }
        (_, other) => {
            return Err(TransportError::Url(format!("unsupported scheme: {other}")));
        }
    };
    url.set_scheme(target)
        .map_err(|_| TransportError::Url(format!("cannot switch scheme to {target}")))
}

fn push_segments(url: &mut Url, segments: &[&str]) -> Result<(), TransportError> {
    let mut path = url
        .path_segments_mut()
        .map_err(|_| TransportError::Url("url cannot be a base".to_string()))?;
    path.pop_if_empty();
    for segment in segments {
        path.push(segment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_rewrites_http_base() {
        let url = socket_url("http://localhost:8000", "abc-123", None).expect("url");
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/abc-123");

        let url = socket_url("https://api.example.com/backend/", "s1", None).expect("url");
        assert_eq!(url.as_str(), "wss://api.example.com/backend/ws/s1");
    }

    #[test]
    fn socket_url_prefers_explicit_address() {
        let url = socket_url(
            "http://localhost:8000",
            "ignored",
            Some("https://edge.example.com/live/s9"),
        )
        .expect("url");
        assert_eq!(url.as_str(), "wss://edge.example.com/live/s9");
    }

    #[test]
    fn stream_url_derives_from_base() {
        let url = stream_url("ws://localhost:8000", "abc", None).expect("url");
        assert_eq!(url.as_str(), "http://localhost:8000/ws/abc/stream");
    }

    #[test]
    fn stream_url_appends_suffix_to_explicit_socket_address_once() {
        let url = stream_url("http://unused", "s", Some("wss://edge.example.com/ws/s")).expect("url");
        assert_eq!(url.as_str(), "https://edge.example.com/ws/s/stream");

        let url = stream_url("http://unused", "s", Some("ws://edge/ws/s/stream")).expect("url");
        assert_eq!(url.as_str(), "http://edge/ws/s/stream");
    }

    #[test]
    fn session_ids_are_percent_encoded() {
        let url = socket_url("http://localhost:8000", "a b/c", None).expect("url");
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/a%20b%2Fc");
    }

    #[test]
    fn rejects_unsupported_schemes() {
        assert!(matches!(
            socket_url("ftp://host", "s", None),
            Err(TransportError::Url(_))
        ));
        assert!(matches!(
            socket_url("not a url", "s", None),
            Err(TransportError::Url(_))
        ));
    }
}
