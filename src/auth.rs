use chrono::Utc;
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;

use crate::vault::Credential;

pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

#[derive(Debug)]
pub enum AuthError {
    Http(String),
    Parse(String),
    Secret(String),
    Input(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Http(e) => write!(f, "HTTP error: {}", e),
            AuthError::Parse(e) => write!(f, "Parse error: {}", e),
            AuthError::Secret(e) => write!(f, "Client secret error: {}", e),
            AuthError::Input(e) => write!(f, "Input error: {}", e),
        }
    }
}

/// The OAuth client registration, as downloaded from the Google Cloud
/// console (client_secret.json).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

/// Load `client_secret.json` from the config directory. Accepts either the
/// "installed" or "web" application shape.
pub fn load_client_secret(config_dir: &Path) -> Result<ClientSecret, AuthError> {
    let path = config_dir.join("client_secret.json");
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        AuthError::Secret(format!(
            "cannot read {}: {} (download it from the Google Cloud console)",
            path.display(),
            e
        ))
    })?;
    let file: ClientSecretFile = serde_json::from_str(&contents)
        .map_err(|e| AuthError::Secret(format!("cannot parse {}: {}", path.display(), e)))?;
    file.installed.or(file.web).ok_or_else(|| {
        AuthError::Secret(format!(
            "{} has neither an \"installed\" nor a \"web\" section",
            path.display()
        ))
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// The consent URL the user opens in a browser to authorize the account.
pub fn consent_url(client: &ClientSecret, email: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&login_hint={}",
        GOOGLE_AUTH_URL,
        percent_encode(&client.client_id),
        percent_encode(OOB_REDIRECT_URI),
        percent_encode(GMAIL_READONLY_SCOPE),
        percent_encode(email)
    )
}

fn credential_from_response(
    client: &ClientSecret,
    response: TokenResponse,
    previous_refresh_token: Option<String>,
) -> Credential {
    let expiry = response
        .expires_in
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
    let scopes = response
        .scope
        .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
        .unwrap_or_else(|| vec![GMAIL_READONLY_SCOPE.to_string()]);
    Credential {
        access_token: response.access_token,
        refresh_token: response.refresh_token.or(previous_refresh_token),
        token_uri: client.token_uri.clone(),
        client_id: client.client_id.clone(),
        client_secret: client.client_secret.clone(),
        scopes,
        expiry,
    }
}

fn post_token_request(
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, AuthError> {
    log_debug!("[AUTH] POST {}", token_uri);
    let response = ureq::post(token_uri).send_form(form).map_err(|e| match e {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            AuthError::Http(format!("token endpoint returned {}: {}", code, body))
        }
        e => AuthError::Http(e.to_string()),
    })?;
    let body = response
        .into_string()
        .map_err(|e| AuthError::Parse(format!("failed to read token response: {}", e)))?;
    serde_json::from_str(&body)
        .map_err(|e| AuthError::Parse(format!("failed to parse token response: {}", e)))
}

/// Exchange a pasted authorization code for tokens.
pub fn exchange_code(client: &ClientSecret, code: &str) -> Result<Credential, AuthError> {
    let response = post_token_request(
        &client.token_uri,
        &[
            ("code", code),
            ("client_id", &client.client_id),
            ("client_secret", &client.client_secret),
            ("redirect_uri", OOB_REDIRECT_URI),
            ("grant_type", "authorization_code"),
        ],
    )?;
    Ok(credential_from_response(client, response, None))
}

/// Mint a fresh access token from the stored refresh token. The returned
/// credential replaces the old one in the vault.
pub fn refresh(credential: &Credential) -> Result<Credential, AuthError> {
    let refresh_token = credential.refresh_token.as_deref().ok_or_else(|| {
        AuthError::Http("no refresh token stored; re-authorization required".to_string())
    })?;

    let response = post_token_request(
        &credential.token_uri,
        &[
            ("refresh_token", refresh_token),
            ("client_id", &credential.client_id),
            ("client_secret", &credential.client_secret),
            ("grant_type", "refresh_token"),
        ],
    )?;

    let client = ClientSecret {
        client_id: credential.client_id.clone(),
        client_secret: credential.client_secret.clone(),
        token_uri: credential.token_uri.clone(),
    };
    Ok(credential_from_response(
        &client,
        response,
        credential.refresh_token.clone(),
    ))
}

/// Interactive authorization: print the consent URL, read the code from
/// stdin, exchange it.
pub fn authorize_interactive(
    client: &ClientSecret,
    email: &str,
) -> Result<Credential, AuthError> {
    println!("Open this URL in a browser and authorize {}:", email);
    println!();
    println!("  {}", consent_url(client, email));
    println!();
    print!("Paste the authorization code here: ");
    use std::io::Write as _;
    std::io::stdout()
        .flush()
        .map_err(|e| AuthError::Input(e.to_string()))?;

    let mut code = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut code)
        .map_err(|e| AuthError::Input(e.to_string()))?;
    let code = code.trim();
    if code.is_empty() {
        return Err(AuthError::Input("no authorization code entered".to_string()));
    }

    exchange_code(client, code)
}
