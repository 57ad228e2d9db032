//! Session tokens handed back by the identity provider in the redirect URL
//! fragment (`#access_token=...&refresh_token=...`).

use std::fmt;

use thiserror::Error;
use url::form_urlencoded;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("redirect carried no fragment")]
    Empty,

    #[error("fragment has no access_token")]
    MissingAccessToken,

    #[error("expires_in is not a number of seconds: {0}")]
    InvalidExpiry(String),

    #[error("identity provider returned {error}: {description}")]
    Provider { error: String, description: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub token_type: Option<String>,
}

impl SessionTokens {
    /// Accepts the bare fragment, the fragment with its leading `#`, or the
    /// whole redirect URL.
    pub fn from_fragment(input: &str) -> Result<Self, FragmentError> {
        let fragment = match input.split_once('#') {
            Some((_, fragment)) => fragment,
            None if input.contains("://") => "",
            None => input,
        };
        if fragment.trim().is_empty() {
            return Err(FragmentError::Empty);
        }

        let mut access_token = None;
        let mut refresh_token = None;
        let mut expires_in = None;
        let mut token_type = None;
        let mut error = None;
        let mut description = None;

        for (name, value) in form_urlencoded::parse(fragment.as_bytes()) {
            let value = value.into_owned();
            match name.as_ref() {
                "access_token" => access_token = Some(value),
                "refresh_token" => refresh_token = Some(value),
                "token_type" => token_type = Some(value),
                "expires_in" => {
                    let seconds = value
                        .parse::<u64>()
                        .map_err(|_| FragmentError::InvalidExpiry(value.clone()))?;
                    expires_in = Some(seconds);
                }
                "error" => error = Some(value),
                "error_description" => description = Some(value),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Err(FragmentError::Provider {
                error,
                description: description.unwrap_or_default(),
            });
        }

        let access_token = access_token
            .filter(|t| !t.is_empty())
            .ok_or(FragmentError::MissingAccessToken)?;

        Ok(Self {
            access_token,
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_in,
            token_type,
        })
    }
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}
