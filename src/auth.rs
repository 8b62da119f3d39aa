// Auth module: OAuth2 device-code login and token refresh. `DeviceAuthFlow`
// owns the state machine: no token means a device login, a token inside the
// expiry margin means a refresh, anything else is left alone. `Authenticator`
// pairs the flow with the session of this run and hands out `Bearer`
// credentials, checking the session before each one.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::credentials::{CredentialStore, Session, SessionState};
use crate::error::AuthError;

/// Response from POST /oauth/device/code.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    /// Code used when polling the token endpoint.
    pub device_code: String,
    /// Code the user confirms in the browser.
    pub user_code: String,
    /// Verification page with the user code already filled in.
    pub verification_uri_complete: String,
    /// Seconds until the device code expires.
    pub expires_in: u64,
    /// Seconds to wait between token polls.
    pub interval: u64,
}

/// Successful response from POST /oauth/token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Token lifetime in seconds.
    pub expires_in: i64,
    /// Only present on the device grant, or when the server rotates it.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The auth provider's endpoints.
pub trait AuthEndpoint {
    fn request_device_code(&self, session: &Session) -> Result<DeviceCode, AuthError>;

    /// Ask whether the device code has been confirmed.
    ///
    /// Returns `Ok(None)` while confirmation is pending. A denied code looks the
    /// same as a pending one.
    fn poll_device_token(
        &self,
        session: &Session,
        device_code: &str,
    ) -> Result<Option<TokenGrant>, AuthError>;

    fn refresh(&self, session: &Session, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

impl<T: AuthEndpoint + ?Sized> AuthEndpoint for &T {
    fn request_device_code(&self, session: &Session) -> Result<DeviceCode, AuthError> {
        (**self).request_device_code(session)
    }

    fn poll_device_token(
        &self,
        session: &Session,
        device_code: &str,
    ) -> Result<Option<TokenGrant>, AuthError> {
        (**self).poll_device_token(session, device_code)
    }

    fn refresh(&self, session: &Session, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        (**self).refresh(session, refresh_token)
    }
}

/// Credentials attached to a single processing API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bearer {
    pub access_token: String,
    pub organization_id: String,
    pub user_agent: String,
}

/// Anything that can produce valid credentials for the processing API.
pub trait SessionProvider {
    fn bearer(&mut self) -> Result<Bearer, AuthError>;
}

/// Device login and refresh against an [`AuthEndpoint`], persisting every change.
pub struct DeviceAuthFlow<E> {
    endpoint: E,
    store: CredentialStore,
    prompt: fn(&DeviceCode),
    sleep: fn(Duration),
    clock: fn() -> i64,
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

impl<E: AuthEndpoint> DeviceAuthFlow<E> {
    /// `prompt` shows the user code to the user once a device code is issued.
    pub fn new(endpoint: E, store: CredentialStore, prompt: fn(&DeviceCode)) -> Self {
        Self {
            endpoint,
            store,
            prompt,
            sleep: std::thread::sleep,
            clock: unix_now,
        }
    }

    /// Replace the function used to wait between token polls.
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Replace the source of the current epoch second.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Make sure `session` carries an access token that is not about to expire.
    ///
    /// Does nothing, and touches neither the network nor the disk, when the
    /// current token is still valid.
    pub fn ensure_session(&self, session: &mut Session) -> Result<(), AuthError> {
        match session.state((self.clock)()) {
            SessionState::Valid => Ok(()),
            SessionState::Unauthenticated => {
                info!("No access token stored, starting device login");
                let grant = self.device_login(session)?;
                self.apply_grant(session, grant);
                self.store.save(session)?;
                info!("Device login complete");
                Ok(())
            }
            SessionState::Expiring => {
                self.refresh(session)?;
                self.store.save(session)?;
                info!("Access token refreshed");
                Ok(())
            }
        }
    }

    fn device_login(&self, session: &Session) -> Result<TokenGrant, AuthError> {
        let code = self.endpoint.request_device_code(session)?;
        (self.prompt)(&code);

        let interval = code.interval.max(1);
        let mut waited = 0;
        while waited < code.expires_in {
            if let Some(grant) = self.endpoint.poll_device_token(session, &code.device_code)? {
                return Ok(grant);
            }
            debug!("Device code not confirmed yet ({waited}s of {}s)", code.expires_in);
            waited += interval;
            (self.sleep)(Duration::from_secs(interval));
        }
        Err(AuthError::Timeout { waited })
    }

    fn refresh(&self, session: &mut Session) -> Result<(), AuthError> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            warn!("Access token expired and no refresh token stored, clearing stored tokens");
            session.clear_tokens();
            self.store.save(session)?;
            return Err(AuthError::MissingRefreshToken);
        };
        match self.endpoint.refresh(session, &refresh_token) {
            Ok(grant) => {
                self.apply_grant(session, grant);
                Ok(())
            }
            Err(AuthError::Status { status, body }) if (400..500).contains(&status) => {
                warn!("Refresh token rejected with HTTP {status}, clearing stored tokens");
                session.clear_tokens();
                self.store.save(session)?;
                Err(AuthError::RefreshFailed(format!("HTTP {status}: {body}")))
            }
            Err(e) => Err(AuthError::RefreshFailed(e.to_string())),
        }
    }

    /// Store a grant. Expiry counts from when the grant arrived.
    fn apply_grant(&self, session: &mut Session, grant: TokenGrant) {
        session.set_access(grant.access_token, (self.clock)() + grant.expires_in);
        if let Some(refresh_token) = grant.refresh_token {
            session.refresh_token = Some(refresh_token);
        }
    }
}

/// The session of this run together with the flow that keeps it valid.
///
/// All token checks and refreshes go through `&mut self`, so there is a single
/// writer for the session and its file.
pub struct Authenticator<E> {
    flow: DeviceAuthFlow<E>,
    session: Session,
}

impl<E: AuthEndpoint> Authenticator<E> {
    pub fn new(flow: DeviceAuthFlow<E>, session: Session) -> Self {
        Self { flow, session }
    }

    pub fn ensure_session(&mut self) -> Result<&Session, AuthError> {
        self.flow.ensure_session(&mut self.session)?;
        Ok(&self.session)
    }
}

impl<E: AuthEndpoint> SessionProvider for Authenticator<E> {
    fn bearer(&mut self) -> Result<Bearer, AuthError> {
        let session = self.ensure_session()?;
        let access = session
            .access()
            .ok_or_else(|| AuthError::RefreshFailed("no access token after login".into()))?;
        Ok(Bearer {
            access_token: access.token.clone(),
            organization_id: session.organization_id.clone(),
            user_agent: session.device_label.clone(),
        })
    }
}
