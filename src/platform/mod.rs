pub mod credentials;
pub mod paths;

pub use credentials::{
    ChainedCredentials, CredentialSource, EnvCredentials, KeyringCredentials, StaticCredentials,
};
pub use paths::AppPaths;
