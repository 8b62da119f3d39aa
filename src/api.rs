// API client module: one blocking HTTP client that talks to both the auth
// provider and the image-processing API. It implements the `AuthEndpoint`
// and `ProcessingApi` traits so the auth flow and the pipeline never see
// reqwest directly.

use anyhow::{Context, Result};
use log::warn;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::USER_AGENT;
use reqwest::Url;
use serde::Deserialize;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::auth::{AuthEndpoint, Bearer, DeviceCode, TokenGrant};
use crate::credentials::Session;
use crate::error::{AuthError, CatalogError, ExecutionError};
use crate::files;
use crate::pipeline::{ProcessingApi, StatusReport};
use crate::settings::Settings;
use crate::workflow::Workflow;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Characters left as-is in path segments built from server values: letters,
/// digits, `/` and the unreserved marks `-_.~`.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Which failures a request may be repeated after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Connection failures, timeouts and 5xx responses.
    Transient,
    /// Only failures to connect, where the server never saw the request.
    ConnectOnly,
}

fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Blocking client holding the reqwest client and both base URLs.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    auth_base: Url,
    api_base: Url,
    audience: String,
    retries: u32,
}

/// Body of GET /v1/workflow.
#[derive(Deserialize, Debug)]
struct WorkflowPage {
    entries: Vec<Workflow>,
}

/// Body of GET /v1/workflow/execution/<id>.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecutionBody {
    status: String,
    #[serde(default)]
    result_path: Option<String>,
}

impl ApiClient {
    /// Create an ApiClient from the base URLs and timeouts in `settings`.
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let auth_base = Url::parse(&settings.auth_url)
            .with_context(|| format!("Invalid auth URL {}", settings.auth_url))?;
        let api_base = Url::parse(&settings.api_url)
            .with_context(|| format!("Invalid API URL {}", settings.api_url))?;
        Ok(ApiClient {
            client,
            auth_base,
            api_base,
            audience: settings.audience.clone(),
            retries: settings.http_retries,
        })
    }

    fn auth_url(&self, path: &str) -> Url {
        let mut url = self.auth_base.clone();
        url.set_path(path);
        url
    }

    /// API URL for `path` with the organization query parameter. Parts of
    /// `path` taken from server responses must already be percent-encoded.
    fn api_url(&self, path: &str, organization_id: &str) -> Url {
        let mut url = self.api_base.clone();
        url.set_path(path);
        url.query_pairs_mut().append_pair("organization", organization_id);
        url
    }

    fn authorized(&self, request: RequestBuilder, bearer: &Bearer) -> RequestBuilder {
        request
            .bearer_auth(&bearer.access_token)
            .header(USER_AGENT, &bearer.user_agent)
    }

    /// Send a request, retrying the failures `retry` allows. `build` is called
    /// again for every attempt because request bodies such as multipart
    /// uploads can only be sent once.
    fn send_with_retry<E>(
        &self,
        retry: Retry,
        mut build: impl FnMut() -> Result<RequestBuilder, E>,
    ) -> Result<Response, E>
    where
        E: From<reqwest::Error>,
    {
        let mut attempt = 0;
        loop {
            let result = build()?.send();
            let transient = match (&result, retry) {
                (Ok(res), Retry::Transient) if res.status().is_server_error() => {
                    Some(format!("HTTP {}", res.status()))
                }
                (Err(e), Retry::Transient) if e.is_timeout() => Some(e.to_string()),
                (Err(e), _) if e.is_connect() => Some(e.to_string()),
                _ => None,
            };
            let retry_reason = match transient {
                Some(reason) if attempt < self.retries => reason,
                _ => return result.map_err(E::from),
            };
            attempt += 1;
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            warn!(
                "Request failed ({retry_reason}), retrying in {delay:?} (attempt {attempt} of {})",
                self.retries
            );
            thread::sleep(delay);
        }
    }

    fn post_token_form(
        &self,
        session: &Session,
        form: &[(&str, &str)],
    ) -> Result<Response, AuthError> {
        let url = self.auth_url("/oauth/token");
        self.send_with_retry(Retry::Transient, || {
            Ok::<_, AuthError>(
                self.client
                    .post(url.clone())
                    .header(USER_AGENT, &session.device_label)
                    .form(form),
            )
        })
    }
}

/// Status code and body of a failed response.
fn failure(res: Response) -> (u16, String) {
    let status = res.status().as_u16();
    let body = res.text().unwrap_or_else(|_| "".into());
    (status, body)
}

impl AuthEndpoint for ApiClient {
    fn request_device_code(&self, session: &Session) -> Result<DeviceCode, AuthError> {
        let url = self.auth_url("/oauth/device/code");
        let form = [
            ("client_id", session.client_id.as_str()),
            ("scope", "offline_access"),
            ("audience", self.audience.as_str()),
        ];
        let res = self.send_with_retry(Retry::Transient, || {
            Ok::<_, AuthError>(
                self.client
                    .post(url.clone())
                    .header(USER_AGENT, &session.device_label)
                    .form(&form[..]),
            )
        })?;
        if !res.status().is_success() {
            let (status, body) = failure(res);
            return Err(AuthError::Status { status, body });
        }
        Ok(res.json()?)
    }

    fn poll_device_token(
        &self,
        session: &Session,
        device_code: &str,
    ) -> Result<Option<TokenGrant>, AuthError> {
        let res = self.post_token_form(
            session,
            &[
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", device_code),
                ("client_id", session.client_id.as_str()),
            ],
        )?;
        let status = res.status();
        if status.is_success() {
            return Ok(Some(res.json()?));
        }
        // The provider answers 4xx both while the code is pending and after
        // the user denied it.
        if status.is_client_error() {
            return Ok(None);
        }
        let (status, body) = failure(res);
        Err(AuthError::Status { status, body })
    }

    fn refresh(&self, session: &Session, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let res = self.post_token_form(
            session,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", session.client_id.as_str()),
            ],
        )?;
        if !res.status().is_success() {
            let (status, body) = failure(res);
            return Err(AuthError::Status { status, body });
        }
        Ok(res.json()?)
    }
}

impl ProcessingApi for ApiClient {
    fn list_workflows(&self, bearer: &Bearer) -> Result<Vec<Workflow>, CatalogError> {
        let url = self.api_url("/v1/workflow", &bearer.organization_id);
        let res = self.send_with_retry(Retry::Transient, || {
            Ok::<_, CatalogError>(self.authorized(self.client.get(url.clone()), bearer))
        })?;
        if !res.status().is_success() {
            let (status, body) = failure(res);
            return Err(CatalogError::Status { status, body });
        }
        let page: WorkflowPage = res.json()?;
        Ok(page.entries)
    }

    fn create_execution(
        &self,
        bearer: &Bearer,
        workflow_id: &str,
        file: &Path,
    ) -> Result<String, ExecutionError> {
        let mut url = self.api_url("/v1/workflow/execution/create", &bearer.organization_id);
        url.query_pairs_mut().append_pair("workflow", workflow_id);

        // A 5xx or timeout may still have created the execution, and a second
        // attempt would run the workflow twice.
        let res = self.send_with_retry(Retry::ConnectOnly, || {
            // The part streams the file from disk instead of buffering it.
            let part = multipart::Part::file(file)
                .map_err(|source| ExecutionError::Io {
                    path: file.to_path_buf(),
                    source,
                })?
                .mime_str(files::mime_for(file))?;
            let form = multipart::Form::new().part("file", part);
            Ok::<_, ExecutionError>(
                self.authorized(self.client.post(url.clone()), bearer)
                    .multipart(form),
            )
        })?;
        if !res.status().is_success() {
            let (status, body) = failure(res);
            return Err(ExecutionError::Upload {
                path: file.to_path_buf(),
                status,
                body,
            });
        }
        let body = res.text()?;
        Ok(body.trim().trim_matches('"').to_string())
    }

    fn execution_status(
        &self,
        bearer: &Bearer,
        execution_id: &str,
    ) -> Result<StatusReport, ExecutionError> {
        let url = self.api_url(
            &format!("/v1/workflow/execution/{}", encode_path(execution_id)),
            &bearer.organization_id,
        );
        let res = self.send_with_retry(Retry::Transient, || {
            Ok::<_, ExecutionError>(self.authorized(self.client.get(url.clone()), bearer))
        })?;
        if !res.status().is_success() {
            let (status, body) = failure(res);
            return Err(ExecutionError::Status {
                id: execution_id.to_string(),
                status,
                body,
            });
        }
        let body: ExecutionBody = res.json()?;
        Ok(StatusReport {
            status: body.status.into(),
            result_path: body.result_path,
        })
    }

    fn fetch_result(&self, bearer: &Bearer, result_path: &str) -> Result<Vec<u8>, ExecutionError> {
        let url = self.api_url(
            &format!("/v1{}", encode_path(result_path)),
            &bearer.organization_id,
        );
        let res = self.send_with_retry(Retry::Transient, || {
            Ok::<_, ExecutionError>(self.authorized(self.client.get(url.clone()), bearer))
        })?;
        if !res.status().is_success() {
            let (status, body) = failure(res);
            return Err(ExecutionError::Download {
                result_path: result_path.to_string(),
                status,
                body,
            });
        }
        Ok(res.bytes()?.to_vec())
    }
}
