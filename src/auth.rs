use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use graph_rs_sdk::oauth::OAuth;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use warp::{Filter, Rejection, Reply};

use crate::error::{Error, Result};

pub const GENOMICS_SCOPE: &str = "https://www.googleapis.com/auth/genomics";
pub const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const ACCESS_TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";

/// Redirect URI for installed applications that paste the code by hand.
pub const OUT_OF_BAND_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

/// A token this close to its recorded expiry is already treated as stale.
const EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// A bearer token, with the refresh token and expiry the token endpoint
/// handed out alongside it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    /// Unix time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn expiring_at(mut self, unix_secs: u64) -> Self {
        self.expires_at = Some(unix_secs);
        self
    }

    pub fn expiring_in(self, seconds: i64) -> Self {
        self.expiring_at(unix_now().saturating_add_signed(seconds))
    }

    pub fn bearer_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Tokens without a recorded expiry never expire here; the API rejects them instead.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now.saturating_add(EXPIRY_MARGIN_SECS) >= expires_at)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Builds a credential from the fields of a token endpoint response.
fn credential_from_token_fields(access_token: &str, fields: &Value) -> Credential {
    let mut credential = Credential::new(access_token);
    if let Some(refresh_token) = fields.get("refresh_token").and_then(Value::as_str) {
        credential = credential.with_refresh_token(refresh_token);
    }
    if let Some(expires_in) = fields.get("expires_in").and_then(Value::as_i64) {
        credential = credential.expiring_in(expires_in);
    }
    credential
}

/// File-backed credential cache.
#[derive(Clone, Debug)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached credential, expired or not. A cache that is missing or
    /// unusable is reported as empty so that the interactive flow can replace it.
    pub fn load(&self) -> Option<Credential> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no cached credential");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read token cache");
                return None;
            }
        };

        match serde_json::from_str::<Credential>(&contents) {
            Ok(credential) if !credential.access_token.trim().is_empty() => Some(credential),
            Ok(_) => {
                warn!(path = %self.path.display(), "token cache holds an empty token");
                None
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "token cache is not valid json");
                None
            }
        }
    }

    pub fn store(&self, credential: &Credential) -> Result<()> {
        let contents = serde_json::to_vec_pretty(credential)?;
        write_private(&self.path, &contents).map_err(|source| Error::TokenCache {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}

/// Builds the consent page URL the user has to visit.
pub fn authorization_url(credentials: &ClientCredentials, redirect_uri: &str) -> Result<Url> {
    Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("response_type", "code"),
            ("client_id", credentials.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", GENOMICS_SCOPE),
            ("access_type", "offline"),
        ],
    )
    .map_err(|err| Error::InvalidUrl(format!("{AUTHORIZE_URL}: {err}")))
}

/// Delivers the one-time authorization code after the user has seen the consent URL.
#[async_trait]
pub trait CodeReceiver {
    fn redirect_uri(&self) -> String;

    async fn receive_code(&mut self, authorization_url: &Url) -> Result<String>;
}

/// Talks to the token endpoint.
#[async_trait]
pub trait CodeExchange {
    /// Swaps an authorization code for a credential.
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<Credential>;

    /// Obtains a fresh access token for an expired credential.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}

/// Prints the consent URL and reads the pasted code from a line of input.
pub struct PromptReceiver<R, W> {
    input: R,
    output: W,
}

impl PromptReceiver<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> PromptReceiver<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

#[async_trait]
impl<R, W> CodeReceiver for PromptReceiver<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn redirect_uri(&self) -> String {
        OUT_OF_BAND_REDIRECT.to_string()
    }

    async fn receive_code(&mut self, authorization_url: &Url) -> Result<String> {
        let prompt = format!(
            "Please visit the below URL to obtain OAuth2 code.\n\n{authorization_url}\n\nPlease enter the code here:\n"
        );
        self.output.write_all(prompt.as_bytes()).await?;
        self.output.flush().await?;

        let mut line = String::new();
        self.input.read_line(&mut line).await?;

        let code = line.trim();
        if code.is_empty() {
            return Err(Error::Authorization(
                "no authorization code was entered".to_string(),
            ));
        }
        Ok(code.to_string())
    }
}

/// Query parameters of the browser redirect.
#[derive(Default, Debug, Clone, Deserialize, PartialEq)]
pub struct RedirectQuery {
    code: Option<String>,
    error: Option<String>,
}

impl RedirectQuery {
    fn into_code(self) -> Result<String> {
        match (self.code, self.error) {
            (Some(code), _) if !code.is_empty() => Ok(code),
            (_, Some(error)) => Err(Error::Authorization(format!(
                "consent was not granted: {error}"
            ))),
            _ => Err(Error::Authorization(
                "redirect carried no authorization code".to_string(),
            )),
        }
    }
}

/// Receives the code through a browser redirect to a short-lived local listener.
pub struct LocalServerReceiver {
    port: u16,
    open_browser: bool,
}

impl LocalServerReceiver {
    pub const DEFAULT_PORT: u16 = 23456;

    pub fn new(port: u16) -> Self {
        Self {
            port,
            open_browser: true,
        }
    }

    /// Whether to launch the consent page in the default browser. The URL is
    /// printed either way.
    pub fn open_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }
}

#[async_trait]
impl CodeReceiver for LocalServerReceiver {
    fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/redirect", self.port)
    }

    async fn receive_code(&mut self, authorization_url: &Url) -> Result<String> {
        let (query_tx, mut query_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let (addr, server) = warp::serve(redirect_routes(query_tx))
            .try_bind_with_graceful_shutdown(([127, 0, 0, 1], self.port), async move {
                shutdown_rx.await.ok();
            })
            .map_err(|err| {
                Error::Authorization(format!("failed to start the redirect listener: {err}"))
            })?;
        tokio::spawn(server);
        info!(%addr, "waiting for the authorization redirect");

        println!("Please visit the below URL to authorize this application.");
        println!();
        println!("{authorization_url}");
        println!();
        if self.open_browser {
            if let Err(err) = webbrowser::open(authorization_url.as_str()) {
                warn!(error = %err, "failed to open a browser; visit the printed URL instead");
            }
        }

        let query = query_rx.recv().await.ok_or_else(|| {
            Error::Authorization("redirect listener stopped before a code arrived".to_string())
        })?;
        shutdown_tx.send(()).ok();

        query.into_code()
    }
}

/// Sets up the `/redirect` route that forwards the consent result to `query_tx`.
fn redirect_routes(
    query_tx: mpsc::UnboundedSender<RedirectQuery>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path("redirect"))
        .and(warp::path::end())
        .and(warp::query::<RedirectQuery>())
        .map(move |query: RedirectQuery| {
            let reply = if query.code.is_some() {
                "Successfully authorized! You can close your browser."
            } else {
                "Authorization was not granted. You can close your browser."
            };
            if query_tx.send(query).is_err() {
                warn!("authorization redirect arrived after the listener stopped waiting");
            }
            reply
        })
}

/// Authorization-code grant and token refresh against the Google token endpoint.
pub struct OAuthCodeExchange {
    credentials: ClientCredentials,
    token_url: String,
    client: reqwest::Client,
}

impl OAuthCodeExchange {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            credentials,
            token_url: ACCESS_TOKEN_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn new_oauth_client(&self, redirect_uri: &str) -> OAuth {
        let mut oauth = OAuth::new();
        oauth
            .client_id(&self.credentials.client_id)
            .client_secret(&self.credentials.client_secret)
            .add_scope(GENOMICS_SCOPE)
            .redirect_uri(redirect_uri)
            .authorize_url(AUTHORIZE_URL)
            .access_token_url(&self.token_url);
        oauth
    }
}

#[async_trait]
impl CodeExchange for OAuthCodeExchange {
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<Credential> {
        let mut oauth = self.new_oauth_client(redirect_uri);
        oauth.access_code(code);

        let mut request = oauth.build_async().authorization_code_grant();
        let access_token = request
            .access_token()
            .send()
            .await
            .map_err(|err| Error::Authorization(format!("code exchange failed: {err}")))?;

        let fields = serde_json::to_value(&access_token)?;
        Ok(credential_from_token_fields(
            access_token.bearer_token(),
            &fields,
        ))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        debug!(token_url = %self.token_url, "refreshing access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|source| Error::Transport {
                endpoint: self.token_url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Authorization(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        let fields: Value = response.json().await.map_err(|source| Error::Transport {
            endpoint: self.token_url.clone(),
            source,
        })?;
        let access_token = fields
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Authorization("token refresh response has no access_token".to_string())
            })?;

        Ok(credential_from_token_fields(access_token, &fields))
    }
}

/// Produces a usable credential, from the cache when possible.
pub struct Authorizer {
    credentials: ClientCredentials,
    cache: TokenCache,
}

impl Authorizer {
    pub fn new(credentials: ClientCredentials, cache: TokenCache) -> Self {
        Self { credentials, cache }
    }

    pub async fn authorize<R, E>(&self, receiver: &mut R, exchange: &E) -> Result<Credential>
    where
        R: CodeReceiver,
        E: CodeExchange,
    {
        if let Some(cached) = self.cache.load() {
            if !cached.is_expired() {
                info!(path = %self.cache.path().display(), "using cached credential");
                return Ok(cached);
            }

            match cached.refresh_token() {
                Some(refresh_token) => match exchange.refresh(refresh_token).await {
                    Ok(refreshed) => {
                        // Google keeps the refresh token valid and does not resend it.
                        let refreshed = if refreshed.refresh_token().is_some() {
                            refreshed
                        } else {
                            refreshed.with_refresh_token(refresh_token)
                        };
                        self.cache.store(&refreshed)?;
                        info!(path = %self.cache.path().display(), "refreshed cached credential");
                        return Ok(refreshed);
                    }
                    Err(err) => {
                        warn!(error = %err, "token refresh failed; asking for a new authorization");
                    }
                },
                None => info!("cached credential expired and cannot be refreshed"),
            }
        }

        let redirect_uri = receiver.redirect_uri();
        let url = authorization_url(&self.credentials, &redirect_uri)?;
        let code = receiver.receive_code(&url).await?;

        let credential = exchange.exchange(&code, &redirect_uri).await?;
        self.cache.store(&credential)?;
        info!(path = %self.cache.path().display(), "stored new credential");

        Ok(credential)
    }
}
