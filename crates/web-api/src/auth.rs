//! JWT 认证器
//!
//! 用 JWT 实现核心的认证协作方契约：令牌有效则由 `sub` 声明得出
//! UserID。凭据里客户端自报的 user_id 仅作交叉校验，不作为身份来源。

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use application::{AuthRejection, Authenticator};
use domain::{Credentials, UserId};

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// UserID
    pub sub: String,
    /// 过期时间 (Unix timestamp)
    pub exp: i64,
}

pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    /// 为用户签发令牌（运维工具与测试用）
    pub fn issue_token(
        &self,
        user_id: &UserId,
        valid_for: chrono::Duration,
    ) -> Result<String, AuthRejection> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (chrono::Utc::now() + valid_for).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| AuthRejection::new(format!("token generation failed: {err}")))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthRejection> {
        let token_data = decode::<Claims>(
            &credentials.token,
            &self.decoding_key,
            &Validation::default(),
        )
        .map_err(|err| AuthRejection::new(format!("invalid token: {err}")))?;

        let user_id = UserId::parse(&token_data.claims.sub)
            .map_err(|err| AuthRejection::new(format!("invalid subject: {err}")))?;

        if !credentials.user_id.is_empty() && credentials.user_id != token_data.claims.sub {
            return Err(AuthRejection::new("token subject mismatch"));
        }
        Ok(user_id)
    }
}
