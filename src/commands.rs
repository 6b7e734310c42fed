//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use wsmux_client::{Client, FetchRequest, HttpResponse, TunnelMessage};
use wsmux_protocol::{HeaderMap, CLOSE_NORMAL};

/// Executes a one-shot command and returns the output string.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Capabilities => {
            let caps = client.capabilities().await?;
            Ok(serde_json::to_string_pretty(&caps)?)
        }

        Commands::Fetch {
            url,
            method,
            headers,
            data,
            include,
        } => {
            let mut request =
                FetchRequest::new(method.to_uppercase(), url).with_headers(parse_headers(&headers)?);
            if let Some(ref data) = data {
                request = request.with_body(parse_body(data)?);
            }

            let response = client.fetch(request).await?;
            Ok(format_response(&response, include))
        }

        Commands::Tunnel { .. } => {
            // Handled separately in main
            unreachable!()
        }
    }
}

/// Runs an interactive tunnel until the remote side closes it or Ctrl+C.
pub async fn run_tunnel(
    client: &Client,
    url: &str,
    protocols: Vec<String>,
    headers: HeaderMap,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut tunnel = client.connect_with_headers(url, protocols, headers).await?;

    let protocol = if tunnel.protocol().is_empty() {
        "none".to_string()
    } else {
        tunnel.protocol().to_string()
    };
    eprintln!(
        "{} {} {}",
        "Connected to".green(),
        url.cyan(),
        format!("(protocol: {})", protocol).dimmed()
    );
    eprintln!("{}", "Type lines to send, Ctrl+C to stop...".dimmed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => tunnel.send_text(line).await?,
                    None => stdin_open = false,
                }
            }
            message = tunnel.recv() => {
                match message {
                    Some(TunnelMessage::Text(text)) => println!("{}", text),
                    Some(TunnelMessage::Binary(data)) => {
                        println!(
                            "{}",
                            format!("<binary, {}>", format_bytes(data.len() as u64)).dimmed()
                        );
                    }
                    Some(TunnelMessage::Error { code, key, message }) => {
                        eprintln!("{}: {} [{}] {}", "Remote error".red(), code, key, message);
                    }
                    Some(TunnelMessage::Close { code, reason }) => {
                        eprintln!("{} {} {}", "Closed".yellow(), code, reason.dimmed());
                        return Ok(());
                    }
                    None => {
                        eprintln!("{}", "Connection lost".red());
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Closing tunnel...".dimmed());
                tunnel.close(CLOSE_NORMAL, "client exit").await?;
                return Ok(());
            }
        }
    }
}

/// Parses repeated `Name: value` arguments into a header map.
pub fn parse_headers(args: &[String]) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for arg in args {
        let (name, value) = parse_header(arg)?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn parse_header(arg: &str) -> Result<(String, String), String> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| format!("invalid header '{}', expected 'Name: value'", arg))?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid header name in '{}'", arg));
    }
    Ok((name.to_ascii_lowercase(), value.trim().to_string()))
}

/// Parses a body argument (either inline text or @file).
fn parse_body(arg: &str) -> Result<Bytes, std::io::Error> {
    if let Some(path) = arg.strip_prefix('@') {
        Ok(Bytes::from(std::fs::read(path)?))
    } else {
        Ok(Bytes::copy_from_slice(arg.as_bytes()))
    }
}

fn format_response(response: &HttpResponse, include: bool) -> String {
    let body = response.text();
    if !include {
        return body;
    }

    let status = format!("{} {}", response.status, response.status_text);
    let status = if response.is_success() {
        status.green()
    } else if response.status >= 400 {
        status.red()
    } else {
        status.yellow()
    };

    let mut out = format!("{}\n", status.bold());
    let mut names: Vec<_> = response.headers.keys().collect();
    names.sort();
    for name in names {
        out.push_str(&format!("{}: {}\n", name.cyan(), response.headers[name]));
    }
    out.push_str(&format!(
        "{}\n\n",
        format!("({})", format_bytes(response.body.len() as u64)).dimmed()
    ));
    out.push_str(&body);
    out
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Content-Type: text/plain; charset=utf-8").unwrap(),
            ("content-type".to_string(), "text/plain; charset=utf-8".to_string())
        );
        assert_eq!(
            parse_header("x-empty:").unwrap(),
            ("x-empty".to_string(), String::new())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
        assert!(parse_header("bad name: value").is_err());
    }

    #[test]
    fn test_parse_headers_last_wins() {
        let headers = parse_headers(&["Accept: a".to_string(), "accept: b".to_string()]).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["accept"], "b");
    }

    #[test]
    fn test_parse_body_inline_and_file() {
        assert_eq!(parse_body("hello").unwrap(), Bytes::from_static(b"hello"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.bin");
        std::fs::write(&path, [0u8, 159, 146, 150]).unwrap();
        let body = parse_body(&format!("@{}", path.display())).unwrap();
        assert_eq!(body.as_ref(), &[0u8, 159, 146, 150]);

        assert!(parse_body("@/definitely/not/here").is_err());
    }

    #[test]
    fn test_format_response() {
        colored::control::set_override(false);

        let response = HttpResponse {
            url: "https://example.com/".into(),
            status: 404,
            status_text: "Not Found".into(),
            headers: HeaderMap::from([
                ("x-b".to_string(), "2".to_string()),
                ("x-a".to_string(), "1".to_string()),
            ]),
            body: Bytes::from_static(b"missing"),
        };

        assert_eq!(format_response(&response, false), "missing");
        assert_eq!(
            format_response(&response, true),
            "404 Not Found\nx-a: 1\nx-b: 2\n(7 B)\n\nmissing"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
