use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::LOCATION;
use reqwest::{redirect, Client, Response};
use sha2::Sha256;
use tracing::info;

use crate::config::{PlatformSection, SessionSection};
use crate::platform::retry::Relogin;
use crate::platform::{PlatformError, PlatformResult};

const OTP_STEP_SECONDS: i64 = 30;
const OTP_DIGITS: u32 = 8;
const SESSION_COOKIE: &str = "user_session";
const MFA_COOKIE: &str = "mfa_session";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub account: String,
    pub password: String,
    otp_secret: Vec<u8>,
}

impl Credentials {
    pub fn from_section(section: &SessionSection) -> PlatformResult<Self> {
        let otp_secret =
            hex::decode(&section.otp_secret).map_err(|_| PlatformError::BadOtpSecret)?;
        Ok(Self {
            account: section.account.clone(),
            password: section.password.clone(),
            otp_secret,
        })
    }
}

/// Authenticated platform session. The token cell is replaced wholesale by
/// every `login`; control flow is single-threaded, so the lock is never
/// contended (it exists to keep the type `Sync`).
pub struct Session {
    http: Client,
    login_url: String,
    credentials: Credentials,
    token: Mutex<Option<String>>,
}

impl Session {
    pub fn new(platform: &PlatformSection, credentials: Credentials) -> PlatformResult<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .user_agent(&platform.user_agent)
            .build()?;
        Ok(Self {
            http,
            login_url: platform.login_url.clone(),
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Cookie-jar-backed HTTP client shared with the platform transports, so
    /// a refreshed session is visible to every subsequent call.
    pub fn client(&self) -> &Client {
        &self.http
    }

    pub fn header_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    pub async fn login(&self) -> PlatformResult<()> {
        let form = [
            ("account", self.credentials.account.as_str()),
            ("password", self.credentials.password.as_str()),
        ];
        let resp = self.http.post(&self.login_url).form(&form).send().await?;
        resp.error_for_status_ref()?;

        if let Some(token) = cookie_value(&resp, SESSION_COOKIE) {
            self.replace_token(token);
            info!("login succeeded");
            return Ok(());
        }
        if cookie_value(&resp, MFA_COOKIE).is_some() {
            let token = self.answer_otp_challenge(&resp).await?;
            self.replace_token(token);
            info!("login succeeded after one-time-password challenge");
            return Ok(());
        }
        Err(PlatformError::LoginRejected)
    }

    async fn answer_otp_challenge(&self, resp: &Response) -> PlatformResult<String> {
        let challenge_url = location_header(resp, "login")?;
        let code = totp_code(&self.credentials.otp_secret, Utc::now().timestamp());
        let challenge = self
            .http
            .post(challenge_url)
            .form(&[("otp", code.as_str()), ("is_mfa_trusted_device", "false")])
            .send()
            .await?;
        challenge.error_for_status_ref()?;

        let confirm_url = location_header(&challenge, "otp challenge")?;
        let confirm = self.http.get(confirm_url).send().await?;
        confirm.error_for_status_ref()?;
        cookie_value(&confirm, SESSION_COOKIE).ok_or(PlatformError::LoginRejected)
    }

    fn replace_token(&self, token: String) {
        *self.token.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl Relogin for Session {
    async fn relogin(&self) -> PlatformResult<()> {
        self.login().await
    }
}

fn cookie_value(resp: &Response, name: &str) -> Option<String> {
    resp.cookies()
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

fn location_header(resp: &Response, operation: &'static str) -> PlatformResult<String> {
    resp.headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(PlatformError::Malformed {
            operation,
            detail: "redirect without a Location header".to_string(),
        })
}

/// RFC 6238 time-based one-time password, HMAC-SHA-256 variant.
pub fn totp_code(secret: &[u8], unix_time: i64) -> String {
    let counter = (unix_time / OTP_STEP_SECONDS) as u64;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    format!(
        "{:0width$}",
        binary % 10u32.pow(OTP_DIGITS),
        width = OTP_DIGITS as usize
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B, SHA-256 rows.
    const RFC_SECRET: &[u8] = b"12345678901234567890123456789012";

    #[test]
    fn totp_matches_the_rfc_6238_vectors() {
        assert_eq!(totp_code(RFC_SECRET, 59), "46119246");
        assert_eq!(totp_code(RFC_SECRET, 1_111_111_109), "68084774");
        assert_eq!(totp_code(RFC_SECRET, 20_000_000_000), "77737706");
    }

    #[test]
    fn totp_is_stable_within_a_step() {
        assert_eq!(totp_code(RFC_SECRET, 30), totp_code(RFC_SECRET, 59));
        assert_ne!(totp_code(RFC_SECRET, 59), totp_code(RFC_SECRET, 60));
    }

    #[test]
    fn credentials_reject_a_non_hex_secret() {
        let section = SessionSection {
            account: "bot".into(),
            password: "pw".into(),
            otp_secret: "not hex".into(),
        };
        assert!(matches!(
            Credentials::from_section(&section),
            Err(PlatformError::BadOtpSecret)
        ));
    }
}
