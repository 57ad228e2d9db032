use jsonwebtoken::{DecodingKey, Validation, decode};

use hush_types::api::Claims;

/// Validate an HS256 bearer token issued by the identity provider.
pub fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    fn token(secret: &str, exp: usize) -> (Uuid, String) {
        let sub = Uuid::new_v4();
        let claims = Claims {
            sub,
            username: "alice".into(),
            exp,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (sub, token)
    }

    #[test]
    fn accepts_valid_token() {
        let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
        let (sub, token) = token("s3cret", exp);
        let claims = verify_token("s3cret", &token).unwrap();
        assert_eq!(claims.sub, sub);
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
        let (_, token) = token("s3cret", exp);
        assert!(verify_token("other", &token).is_none());

        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as usize;
        let (_, expired) = self::token("s3cret", past);
        assert!(verify_token("s3cret", &expired).is_none());
    }
}
