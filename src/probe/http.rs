//! HTTP probe implementation scraping the network management card web UI.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::{FieldMap, ProbeError};
use crate::db::HttpCredentials;

/// Web UI client for one network management card.
///
/// Holds the session token from the last successful login so each cycle
/// only needs a single page fetch.
pub struct NmcScraper {
    client: reqwest::Client,
    session: Option<String>,
}

impl NmcScraper {
    pub fn new() -> Result<Self, ProbeError> {
        // Management cards ship with self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            session: None,
        })
    }

    /// Scrape the universal I/O sensor page.
    ///
    /// A cached session that no longer works is replaced by a fresh login
    /// and the page is fetched once more.
    pub async fn fetch(
        &mut self,
        address: &str,
        credentials: &HttpCredentials,
        port: u16,
        use_tls: bool,
        timeout: Duration,
    ) -> Result<FieldMap, ProbeError> {
        let base = base_url(address, port, use_tls);

        if let Some(session) = self.session.clone() {
            let scraped = self
                .fetch_status_page(&base, &session, timeout)
                .await
                .and_then(|html| parse_status_page(&html));
            match scraped {
                Ok(fields) => return Ok(fields),
                Err(ProbeError::Timeout(t)) => return Err(ProbeError::Timeout(t)),
                Err(e) => {
                    tracing::debug!("NMC session for {} rejected, logging in again: {}", address, e);
                    self.session = None;
                }
            }
        }

        let session = self.login(&base, credentials, timeout).await?;
        tracing::info!("Generated NMC session for {}", address);
        self.session = Some(session.clone());

        let html = self.fetch_status_page(&base, &session, timeout).await?;
        parse_status_page(&html)
    }

    async fn login(
        &self,
        base: &str,
        credentials: &HttpCredentials,
        timeout: Duration,
    ) -> Result<String, ProbeError> {
        let response = self
            .client
            .post(format!("{}/Forms/login1", base))
            .form(&[
                ("prefLanguage", "00000000"),
                ("login_username", credentials.username.as_str()),
                ("login_password", credentials.password.as_str()),
                ("submit", "Log On"),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        check_status(&response)?;

        session_from_url(response.url().as_str())
            .ok_or_else(|| ProbeError::Auth("invalid username or password".to_string()))
    }

    async fn fetch_status_page(
        &self,
        base: &str,
        session: &str,
        timeout: Duration,
    ) -> Result<String, ProbeError> {
        let response = self
            .client
            .get(format!("{}/NMC/{}/uiostatus.htm", base, session))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        check_status(&response)?;

        response.text().await.map_err(|e| request_error(e, timeout))
    }
}

fn base_url(address: &str, port: u16, use_tls: bool) -> String {
    let scheme = if use_tls { "https" } else { "http" };
    format!("{}://{}:{}", scheme, address, port)
}

fn request_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Unreachable(e.to_string())
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), ProbeError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProbeError::Auth(format!("got HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(ProbeError::Unreachable(format!("got HTTP {}", status)));
    }
    Ok(())
}

/// Extract the session token from a post-login URL (`.../NMC/<token>/...`).
fn session_from_url(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"/NMC/([^/]+)/").unwrap());
    re.captures(url).map(|caps| caps[1].to_string())
}

/// Parse sensor rows from `uiostatus.htm`.
///
/// Temperatures reported in Fahrenheit are converted to Celsius. Rows are
/// exposed under the same keys the SNMP sensor table uses.
fn parse_status_page(html: &str) -> Result<FieldMap, ProbeError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(concat!(
            r#"<a href="uiocfg\.htm\?sensor=(?P<id>\d+)"[^>]*>(?P<name>[^<]*)</a></td>\s*"#,
            r#"<td>[^\n]*?</td>\s*"#,
            r#"<td>(?P<temp>-?[\d.]+)&deg;&nbsp;(?P<unit>[FC])</td>\s*"#,
            r#"<td>(?:(?P<rh>\d{1,3})%&nbsp;RH|Not Available)</td>"#,
        ))
        .unwrap()
    });

    let mut fields = FieldMap::new();
    for caps in re.captures_iter(html) {
        let id = &caps["id"];
        let raw_temp: f64 = caps["temp"]
            .parse()
            .map_err(|_| ProbeError::Parse(format!("invalid temperature {:?}", &caps["temp"])))?;
        let celsius = if &caps["unit"] == "F" {
            (raw_temp - 32.0) * 5.0 / 9.0
        } else {
            raw_temp
        };

        fields.insert(format!("uioSensorStatusSensorName.{}", id), caps["name"].trim());
        fields.insert(format!("uioSensorStatusTemperatureDegC.{}", id), celsius.to_string());
        if let Some(rh) = caps.name("rh") {
            fields.insert(format!("uioSensorStatusHumidity.{}", id), rh.as_str());
        }
    }

    if fields.is_empty() && !html.contains("uiocfg.htm") {
        return Err(ProbeError::Parse("no sensor table in status page".to_string()));
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const STATUS_PAGE: &str = "<table>\r\n<tr>\r\n<td><a href=\"uiocfg.htm?sensor=1\" alt=\"Edit\" title=\"Edit\">Rack Front</a></td>\r\n<td><span class=\"se-icon-f4-selection text-success\"></span>&nbsp;Normal</td>\r\n<td>71.6&deg;&nbsp;F</td>\r\n<td>41%&nbsp;RH</td>\r\n</tr>\r\n<tr>\r\n<td><a href=\"uiocfg.htm?sensor=2\" alt=\"Edit\" title=\"Edit\">Battery Cabinet</a></td>\r\n<td><span class=\"se-icon-f4-selection text-success\"></span>&nbsp;Normal</td>\r\n<td>24.5&deg;&nbsp;C</td>\r\n<td>Not Available</td>\r\n</tr>\r\n</table>\n";

    #[test]
    fn test_parse_status_page() {
        let fields = parse_status_page(STATUS_PAGE).unwrap();

        assert_eq!(fields.get("uioSensorStatusSensorName.1"), Some("Rack Front"));
        let front: f64 = fields
            .get("uioSensorStatusTemperatureDegC.1")
            .unwrap()
            .parse()
            .unwrap();
        assert!((front - 22.0).abs() < 1e-9);
        assert_eq!(fields.get("uioSensorStatusHumidity.1"), Some("41"));

        assert_eq!(fields.get("uioSensorStatusSensorName.2"), Some("Battery Cabinet"));
        assert_eq!(fields.get("uioSensorStatusTemperatureDegC.2"), Some("24.5"));
        assert_eq!(fields.get("uioSensorStatusHumidity.2"), None);
    }

    #[test]
    fn test_parse_status_page_rejects_login_page() {
        let result = parse_status_page("<html><form action=\"/Forms/login1\"></form></html>");
        assert!(matches!(result, Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_session_from_url() {
        assert_eq!(
            session_from_url("https://10.0.0.5:443/NMC/Xk2bJ9fQ1a/home.htm").as_deref(),
            Some("Xk2bJ9fQ1a")
        );
        assert_eq!(session_from_url("http://10.0.0.5/logon.htm"), None);
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("10.0.0.5", 443, true), "https://10.0.0.5:443");
        assert_eq!(base_url("ups-a", 8080, false), "http://ups-a:8080");
    }

    /// Minimal NMC stand-in: each login issues a new session that is only
    /// good for one status page fetch.
    async fn serve_nmc(logins: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sessions = Arc::new(Mutex::new(HashSet::new()));

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let logins = logins.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    let path = request.split_whitespace().nth(1).unwrap_or_default();

                    let response = if path == "/Forms/login1" {
                        let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                        let token = format!("tok{}", n);
                        sessions.lock().unwrap().insert(token.clone());
                        respond("303 See Other", &format!("Location: /NMC/{}/home.htm\r\n", token), "")
                    } else if let Some(token) = path
                        .strip_prefix("/NMC/")
                        .and_then(|rest| rest.strip_suffix("/uiostatus.htm"))
                    {
                        if sessions.lock().unwrap().remove(token) {
                            respond("200 OK", "", STATUS_PAGE)
                        } else {
                            respond("403 Forbidden", "", "")
                        }
                    } else {
                        respond("200 OK", "", "<html>home</html>")
                    };

                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        port
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn respond(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            headers,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_fetch_logs_in_again_when_session_rejected() {
        let logins = Arc::new(AtomicUsize::new(0));
        let port = serve_nmc(logins.clone()).await;
        let credentials = HttpCredentials {
            username: "apc".to_string(),
            password: "apc".to_string(),
        };
        let mut scraper = NmcScraper::new().unwrap();
        let timeout = Duration::from_secs(5);

        let first = scraper
            .fetch("127.0.0.1", &credentials, port, false, timeout)
            .await
            .unwrap();
        assert_eq!(first.get("uioSensorStatusSensorName.1"), Some("Rack Front"));
        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(scraper.session.as_deref(), Some("tok1"));

        // tok1 is spent, so the cached session is rejected and replaced.
        let second = scraper
            .fetch("127.0.0.1", &credentials, port, false, timeout)
            .await
            .unwrap();
        assert_eq!(second.get("uioSensorStatusSensorName.2"), Some("Battery Cabinet"));
        assert_eq!(logins.load(Ordering::SeqCst), 2);
        assert_eq!(scraper.session.as_deref(), Some("tok2"));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let mut scraper = NmcScraper::new().unwrap();
        let credentials = HttpCredentials {
            username: "apc".to_string(),
            password: "apc".to_string(),
        };
        let result = scraper
            .fetch("256.256.256.256", &credentials, 80, false, Duration::from_millis(100))
            .await;
        assert!(result.is_err());
    }
}
