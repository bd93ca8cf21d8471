use std::{env, fmt, fs, str::FromStr};

/// Environment variable holding the CivitAI API token.
pub const CIVITAI_TOKEN_VAR: &str = "CIVITAI_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
/// The source of the CivitAI bearer token.
pub enum TokenSource {
    Literal(String),
    EnvVar(String),
    Path(String),
    None,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::EnvVar(CIVITAI_TOKEN_VAR.to_string())
    }
}

impl FromStr for TokenSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(2, ':').collect();
        match parts[0] {
            "literal" => parts
                .get(1)
                .map(|&value| TokenSource::Literal(value.to_string()))
                .ok_or_else(|| "Expected a value for 'literal'".to_string()),
            "env" => Ok(TokenSource::EnvVar(
                parts.get(1).unwrap_or(&CIVITAI_TOKEN_VAR).to_string(),
            )),
            "path" => parts
                .get(1)
                .map(|&value| TokenSource::Path(value.to_string()))
                .ok_or_else(|| "Expected a value for 'path'".to_string()),
            "none" => Ok(TokenSource::None),
            _ => Err("Invalid token source format".to_string()),
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Literal(_) => write!(f, "literal:<redacted>"),
            TokenSource::EnvVar(value) => write!(f, "env:{value}"),
            TokenSource::Path(value) => write!(f, "path:{value}"),
            TokenSource::None => write!(f, "none"),
        }
    }
}

/// Read a token from the given source.
///
/// Returns `None` when the source yields nothing usable (unset variable, unreadable file,
/// blank value). Whether that is fatal is up to the caller.
pub fn get_token(source: &TokenSource) -> Option<String> {
    let token = match source {
        TokenSource::Literal(data) => Some(data.clone()),
        TokenSource::EnvVar(envvar) => env::var(envvar).ok(),
        TokenSource::Path(path) => fs::read_to_string(path).ok(),
        TokenSource::None => None,
    };

    token
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
