use crate::cli::provider::aws::AWSConfigCliArgs;
use aws_config::{BehaviorVersion, Region, SdkConfig};

#[derive(Debug, Clone)]
pub struct AWSCredentials {
    pub region: Option<String>,
}

impl AWSCredentials {
    pub async fn get_aws_config(&self) -> SdkConfig {
        let loader = aws_config::defaults(BehaviorVersion::latest());
        match &self.region {
            Some(region) => loader.region(Region::new(region.clone())).load().await,
            None => loader.load().await,
        }
    }
}

impl From<AWSConfigCliArgs> for AWSCredentials {
    fn from(args: AWSConfigCliArgs) -> Self {
        Self { region: args.aws_region }
    }
}
