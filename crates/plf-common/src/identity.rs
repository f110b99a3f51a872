//! Cloud credential preflight
//!
//! Before anything touches the cloud bucket, the named profile is checked
//! with an STS `GetCallerIdentity` call. The call is always allowed, so a
//! failure means the credentials themselves are missing, expired or wrong.

use std::time::Duration;

use aws_config::profile::ProfileFileCredentialsProvider;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_sts::config::{BehaviorVersion, Region};
use tracing::{debug, info};

use crate::objstore::CloudStoreConfig;
use crate::{Error, Result};

const IDENTITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve the AWS account the configured profile belongs to.
pub async fn verify_cloud_credentials(config: &CloudStoreConfig) -> Result<String> {
    let profile = config.profile.as_deref().unwrap_or("default");
    let provider = ProfileFileCredentialsProvider::builder()
        .profile_name(profile)
        .build();
    let sts_config = aws_sdk_sts::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .credentials_provider(provider)
        .build();
    let client = aws_sdk_sts::Client::from_conf(sts_config);

    debug!(profile, region = %config.region, "checking cloud credentials");
    let call = client.get_caller_identity().send();
    let output = match tokio::time::timeout(IDENTITY_TIMEOUT, call).await {
        Err(_) => {
            return Err(credentials_error(
                profile,
                "timed out waiting for the security token service",
            ))
        }
        Ok(Err(e)) => {
            return Err(credentials_error(
                profile,
                &DisplayErrorContext(&e).to_string(),
            ))
        }
        Ok(Ok(output)) => output,
    };

    let account = output
        .account()
        .ok_or_else(|| credentials_error(profile, "no account id in the caller identity"))?
        .to_string();
    info!(profile, account = %account, "cloud credentials verified");
    Ok(account)
}

fn credentials_error(profile: &str, message: &str) -> Error {
    Error::Credentials {
        profile: profile.to_string(),
        message: message.to_string(),
        hint: credential_hint(profile, message),
    }
}

/// The command that most likely repairs the profile, judged from the error text.
pub fn credential_hint(profile: &str, message: &str) -> String {
    const SESSION_EXPIRED: [&str; 3] = ["ExpiredToken", "SSO", "sso"];
    const NOT_CONFIGURED: [&str; 5] = [
        "NoCredentialProviders",
        "could not be found",
        "was not defined",
        "no credentials",
        "CredentialsNotLoaded",
    ];

    if SESSION_EXPIRED.iter().any(|m| message.contains(m)) {
        format!("run: aws sso login --profile {}", profile)
    } else if NOT_CONFIGURED.iter().any(|m| message.contains(m)) {
        format!("run: aws configure --profile {}", profile)
    } else {
        format!("run: aws sts get-caller-identity --profile {}", profile)
    }
}
