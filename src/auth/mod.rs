//! Credential login flow
//!
//! Drives the platform's form-based login: scrape the hidden form fields
//! from the prepare page, solve the captcha through a pluggable solver,
//! submit, and walk the redirect chain by hand while collecting cookies.
//!
//! Captcha solving is a collaborator, not part of this crate: anything that
//! can turn an image into text (OCR, a human at a terminal) implements
//! [`CaptchaSolver`].

use async_trait::async_trait;
use chrono::{Duration, Utc};
use regex::Regex;
use reqwest::{redirect, Client, Response};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credentials::AccountSession;
use crate::utils::error::{ApiError, BookingError};

/// Turns a captcha image into text
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image: &[u8]) -> anyhow::Result<String>;
}

/// Human-in-the-loop solver: drops the image into a directory and reads the
/// answer from stdin. The default when no OCR collaborator is wired in.
pub struct PromptSolver {
    pub drop_dir: std::path::PathBuf,
}

impl Default for PromptSolver {
    fn default() -> Self {
        Self {
            drop_dir: std::env::temp_dir(),
        }
    }
}

#[async_trait]
impl CaptchaSolver for PromptSolver {
    async fn solve(&self, image: &[u8]) -> anyhow::Result<String> {
        let path = self
            .drop_dir
            .join(format!("captcha_{}.png", Utc::now().timestamp()));
        tokio::fs::write(&path, image).await?;
        println!("Captcha saved to {}; enter the text:", path.display());

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok::<_, std::io::Error>(line.trim().to_string())
        })
        .await??;
        Ok(answer)
    }
}

fn hidden_input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<input[^>]+type="hidden"[^>]*name="(?P<name>[^"]+)"[^>]*value="(?P<value>[^"]*)""#,
        )
        .expect("hidden input regex is valid")
    })
}

/// Scraped state of the login prepare page
#[derive(Debug)]
struct LoginPage {
    form: BTreeMap<String, String>,
    captcha_required: bool,
    referer: String,
}

/// Form-based login client
pub struct LoginFlow {
    http: Client,
    prepare_url: String,
    submit_url: String,
    captcha_url: String,
    session_lifetime_hours: i64,
    max_captcha_attempts: u32,
}

impl LoginFlow {
    pub fn new(config: &Config) -> Result<Self, BookingError> {
        // Redirects are walked manually so every Set-Cookie on the way is
        // captured.
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(15))
            .user_agent(config.platform.user_agent.clone())
            .build()
            .map_err(|e| BookingError::Config(format!("login client: {e}")))?;

        Ok(Self {
            http,
            prepare_url: config.platform.endpoints.login_prepare.clone(),
            submit_url: config.platform.endpoints.login_submit.clone(),
            captcha_url: config.platform.endpoints.login_captcha.clone(),
            session_lifetime_hours: 8,
            max_captcha_attempts: 3,
        })
    }

    pub fn with_max_captcha_attempts(mut self, attempts: u32) -> Self {
        self.max_captcha_attempts = attempts.max(1);
        self
    }

    async fn prepare(&self, cookies: &mut BTreeMap<String, String>) -> Result<LoginPage, BookingError> {
        let response = self
            .http
            .get(&self.prepare_url)
            .send()
            .await
            .map_err(ApiError::Http)?;
        absorb_cookies(cookies, &response);

        let html = response.text().await.map_err(ApiError::Http)?;
        let form = parse_hidden_inputs(&html);
        let captcha_required = html.to_lowercase().contains("captcha");

        debug!(
            fields = form.len(),
            captcha_required, "Login prepare page scraped"
        );
        Ok(LoginPage {
            form,
            captcha_required,
            referer: self.prepare_url.clone(),
        })
    }

    async fn fetch_captcha(
        &self,
        page: &LoginPage,
        cookies: &mut BTreeMap<String, String>,
    ) -> Result<Vec<u8>, BookingError> {
        let separator = if self.captcha_url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}_ts={}",
            self.captcha_url,
            separator,
            Utc::now().timestamp_millis()
        );

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::REFERER, &page.referer)
            .header(reqwest::header::COOKIE, cookie_header(cookies))
            .send()
            .await
            .map_err(ApiError::Http)?;
        absorb_cookies(cookies, &response);

        let bytes = response.bytes().await.map_err(ApiError::Http)?;
        Ok(bytes.to_vec())
    }

    /// Run the full login and return a fresh account session.
    ///
    /// # Errors
    ///
    /// `BookingError::CaptchaFailed` once the solver budget is spent;
    /// transport failures as `ApiError`.
    pub async fn login(
        &self,
        nickname: &str,
        username: &str,
        password: &str,
        solver: &dyn CaptchaSolver,
    ) -> Result<AccountSession, BookingError> {
        let mut last_failure = String::new();

        for attempt in 1..=self.max_captcha_attempts {
            let mut cookies = BTreeMap::new();
            let page = self.prepare(&mut cookies).await?;

            let captcha_text = if page.captcha_required {
                let image = self.fetch_captcha(&page, &mut cookies).await?;
                match solver.solve(&image).await {
                    Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                    Ok(_) => {
                        warn!(attempt, "Captcha solver returned empty text");
                        continue;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Captcha solver failed");
                        continue;
                    }
                }
            } else {
                String::new()
            };

            let mut form = page.form.clone();
            form.insert("user".into(), username.to_string());
            form.insert("pass".into(), password.to_string());
            form.insert("captcha".into(), captcha_text);

            let response = self
                .http
                .post(&self.submit_url)
                .header(reqwest::header::REFERER, &page.referer)
                .header(reqwest::header::COOKIE, cookie_header(&cookies))
                .form(&form)
                .send()
                .await
                .map_err(ApiError::Http)?;
            absorb_cookies(&mut cookies, &response);

            let final_response = self.follow_redirects(response, &mut cookies).await?;
            let status = final_response.status();

            if status.is_success() && !cookies.is_empty() {
                info!(account = nickname, "Login succeeded");
                let mut session = AccountSession::new(nickname, username);
                session.session_cookie = Some(cookie_header(&cookies));
                session.expires_at = Some(Utc::now() + Duration::hours(self.session_lifetime_hours));
                return Ok(session);
            }

            last_failure = format!("login rejected with status {status}");
            warn!(attempt, status = %status, "Login attempt rejected");
        }

        if last_failure.is_empty() {
            Err(BookingError::CaptchaFailed {
                attempts: self.max_captcha_attempts,
            })
        } else {
            Err(BookingError::Config(last_failure))
        }
    }

    async fn follow_redirects(
        &self,
        mut response: Response,
        cookies: &mut BTreeMap<String, String>,
    ) -> Result<Response, BookingError> {
        for _ in 0..5 {
            if !response.status().is_redirection() {
                break;
            }
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                break;
            };

            let url = if location.starts_with("http") {
                location
            } else {
                // Relative redirect: resolve against the previous URL
                let base = response.url().clone();
                base.join(&location)
                    .map(|u| u.to_string())
                    .unwrap_or(location)
            };

            response = self
                .http
                .get(&url)
                .header(reqwest::header::COOKIE, cookie_header(cookies))
                .send()
                .await
                .map_err(ApiError::Http)?;
            absorb_cookies(cookies, &response);
        }
        Ok(response)
    }
}

fn parse_hidden_inputs(html: &str) -> BTreeMap<String, String> {
    hidden_input_re()
        .captures_iter(html)
        .map(|cap| (cap["name"].to_string(), cap["value"].to_string()))
        .collect()
}

fn absorb_cookies(cookies: &mut BTreeMap<String, String>, response: &Response) {
    for value in response.headers().get_all(reqwest::header::SET_COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        let Some(pair) = text.split(';').next() else {
            continue;
        };
        if let Some((name, value)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
}

fn cookie_header(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hidden_inputs() {
        let html = r#"
            <form>
              <input type="hidden" name="csrf" value="tok-1">
              <INPUT TYPE="hidden" name="flow" value="oauth">
              <input type="text" name="user" value="ignored">
            </form>
        "#;
        let form = parse_hidden_inputs(html);
        assert_eq!(form.len(), 2);
        assert_eq!(form["csrf"], "tok-1");
        assert_eq!(form["flow"], "oauth");
    }

    #[test]
    fn test_cookie_header_format() {
        let mut cookies = BTreeMap::new();
        cookies.insert("JSESSIONID".to_string(), "abc".to_string());
        cookies.insert("lang".to_string(), "zh".to_string());
        assert_eq!(cookie_header(&cookies), "JSESSIONID=abc; lang=zh");
    }

    struct FixedSolver(&'static str);

    #[async_trait]
    impl CaptchaSolver for FixedSolver {
        async fn solve(&self, _image: &[u8]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_solver_trait_object() {
        let solver: Box<dyn CaptchaSolver> = Box::new(FixedSolver("AB12"));
        assert_eq!(solver.solve(&[]).await.unwrap(), "AB12");
    }
}
