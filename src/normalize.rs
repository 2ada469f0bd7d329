use url::Url;

/// normalize a URL and replace http://, https:// schemes with ws://, wss://
pub fn normalize_url(url_str: &str) -> Result<Url, url::ParseError> {
    let url_str = match url_str.split_once("://") {
        Some((scheme, _))
            if scheme == "wss" || scheme == "ws" || scheme == "WSS" || scheme == "WS" =>
        {
            url_str.to_string()
        }
        Some((scheme, _))
            if scheme == "https" || scheme == "http" || scheme == "HTTPS" || scheme == "HTTP" =>
        {
            format!("ws{}", &url_str[4..])
        }
        _ => {
            if url_str.starts_with("localhost")
                || url_str.contains(".localhost")
                || url_str.starts_with("127.0.0.1")
            {
                format!("ws://{}", url_str)
            } else {
                format!("wss://{}", url_str)
            }
        }
    };
    let mut url = Url::parse(&url_str)?;

    // normalize host to lowercase
    if let Some(host) = url.host_str() {
        let _ = url.set_host(Some(&host.to_lowercase()));
    }

    // remove trailing slash from path
    let path = url.path().trim_end_matches('/').to_owned();
    url.set_path(&path);

    Ok(url)
}
