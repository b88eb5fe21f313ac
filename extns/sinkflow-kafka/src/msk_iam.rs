//! AWS MSK IAM authentication.
//!
//! MSK brokers accept an OAUTHBEARER token which is a SigV4 presigned `kafka-cluster:Connect`
//! request, base64url encoded. Credentials are resolved through the default AWS provider chain
//! for every token, so rotated credentials (IRSA, instance profiles) are picked up on refresh.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{
    SignableBody, SignableRequest, SignatureLocation, SigningParams, SigningSettings, sign,
};
use aws_sigv4::sign::v4;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::runtime::Handle;
use tracing::debug;

use crate::{BearerToken, Error, Result, TokenProvider};

/// How long a presigned token is accepted by the brokers.
pub const MSK_IAM_TOKEN_LIFETIME: Duration = Duration::from_secs(900);

const SIGNING_NAME: &str = "kafka-cluster";
const PRINCIPAL: &str = "aws-msk-iam";
const USER_AGENT: &str = concat!("sinkflow-msk-iam-", env!("CARGO_PKG_VERSION"));

/// Signs MSK IAM tokens with credentials from an AWS credentials provider.
#[derive(Debug, Clone)]
pub struct MskIamTokenProvider {
    region: String,
    credentials: SharedCredentialsProvider,
    // librdkafka asks for tokens from its own threads, credentials are resolved on this runtime.
    runtime: Handle,
}

impl MskIamTokenProvider {
    pub fn new(
        region: impl Into<String>,
        credentials: SharedCredentialsProvider,
        runtime: Handle,
    ) -> Self {
        Self {
            region: region.into(),
            credentials,
            runtime,
        }
    }

    /// Uses the default AWS credential chain. Must be called from within a tokio runtime.
    pub async fn from_env(region: impl Into<String>) -> Result<Self> {
        let region = region.into();
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;
        let credentials = sdk_config.credentials_provider().ok_or_else(|| {
            Error::Other("No AWS credentials provider found for MSK IAM authentication".into())
        })?;
        Ok(Self::new(region, credentials, Handle::current()))
    }

    fn load_credentials(&self) -> Result<Credentials> {
        let provider = self.credentials.clone();
        let resolve = async move { provider.provide_credentials().await };
        let credentials = if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.runtime.block_on(resolve))
        } else {
            self.runtime.block_on(resolve)
        };
        credentials.map_err(|e| Error::Other(format!("Loading AWS credentials for MSK IAM: {e}")))
    }
}

impl TokenProvider for MskIamTokenProvider {
    fn token(&self) -> Result<BearerToken> {
        let credentials = self.load_credentials()?;
        let token = presign_connect(&self.region, credentials, SystemTime::now())?;
        debug!(region = %self.region, "Signed MSK IAM token");
        Ok(token)
    }
}

/// Presigns `kafka-cluster:Connect` for the region's MSK endpoint.
pub(crate) fn presign_connect(
    region: &str,
    credentials: Credentials,
    now: SystemTime,
) -> Result<BearerToken> {
    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(MSK_IAM_TOKEN_LIFETIME);

    let identity = credentials.into();
    let params: SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(SIGNING_NAME)
        .time(now)
        .settings(settings)
        .build()
        .map_err(|e| Error::Other(format!("Building MSK IAM signing params: {e}")))?
        .into();

    let url = format!("https://kafka.{region}.amazonaws.com/?Action=kafka-cluster%3AConnect");
    let mut request = http::Request::builder()
        .method("GET")
        .uri(url.as_str())
        .body(())
        .map_err(|e| Error::Other(format!("Building MSK IAM connect request: {e}")))?;
    let signable = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::empty(),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| Error::Other(format!("Preparing MSK IAM connect request: {e}")))?;
    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| Error::Other(format!("Signing MSK IAM connect request: {e}")))?
        .into_parts();
    instructions.apply_to_request_http1x(&mut request);

    let presigned = format!("{}&User-Agent={USER_AGENT}", request.uri());
    let expires_at = (now + MSK_IAM_TOKEN_LIFETIME)
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Other(format!("System clock is before unix epoch: {e}")))?;

    Ok(BearerToken {
        token: URL_SAFE_NO_PAD.encode(presigned),
        principal: PRINCIPAL.to_string(),
        lifetime_ms: expires_at.as_millis() as i64,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aws_credential_types::provider::future;
    use test_log::test;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingCredentials {
        calls: Arc<AtomicUsize>,
    }

    impl ProvideCredentials for CountingCredentials {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            future::ProvideCredentials::ready(Ok(static_credentials()))
        }
    }

    fn static_credentials() -> Credentials {
        Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            Some("session-token".to_string()),
            None,
            "static",
        )
    }

    fn decode(token: &BearerToken) -> String {
        String::from_utf8(URL_SAFE_NO_PAD.decode(&token.token).unwrap()).unwrap()
    }

    #[test]
    fn test_presign_connect_with_static_credentials() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let token = presign_connect("us-east-1", static_credentials(), now).unwrap();

        assert_eq!(token.principal, "aws-msk-iam");
        assert_eq!(token.lifetime_ms, (1_700_000_000 + 900) * 1000);
        assert!(!token.token.is_empty());
        assert!(!token.token.contains('='));

        let presigned = decode(&token);
        assert!(presigned.starts_with("https://kafka.us-east-1.amazonaws.com/?"));
        assert!(presigned.contains("Action=kafka-cluster"));
        assert!(presigned.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(presigned.contains("X-Amz-Credential=AKIDEXAMPLE"));
        assert!(presigned.contains("20231114"));
        assert!(presigned.contains("X-Amz-Expires=900"));
        assert!(presigned.contains("X-Amz-Security-Token="));
        assert!(presigned.contains("X-Amz-Signature="));
        assert!(presigned.ends_with(&format!("&User-Agent={USER_AGENT}")));
    }

    #[test]
    fn test_presign_connect_is_deterministic_for_same_instant() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let first = presign_connect("eu-west-1", static_credentials(), now).unwrap();
        let second = presign_connect("eu-west-1", static_credentials(), now).unwrap();
        assert_eq!(first.token, second.token);

        let later = presign_connect(
            "eu-west-1",
            static_credentials(),
            now + Duration::from_secs(60),
        )
        .unwrap();
        assert_ne!(first.token, later.token);
        assert_eq!(later.lifetime_ms - first.lifetime_ms, 60_000);
    }

    #[test]
    fn test_token_provider_resolves_credentials_for_every_token() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = MskIamTokenProvider::new(
            "eu-west-1",
            SharedCredentialsProvider::new(CountingCredentials {
                calls: Arc::clone(&calls),
            }),
            runtime.handle().clone(),
        );

        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let token = provider.token().unwrap();
        provider.token().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(decode(&token).starts_with("https://kafka.eu-west-1.amazonaws.com/?"));
        assert!(token.lifetime_ms >= before + 900_000);
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn test_token_provider_inside_runtime() {
        let provider = MskIamTokenProvider::new(
            "ap-south-1",
            SharedCredentialsProvider::new(static_credentials()),
            Handle::current(),
        );
        let token = provider.token().unwrap();
        assert_eq!(token.principal, "aws-msk-iam");
        assert!(decode(&token).contains("ap-south-1"));
    }
}
