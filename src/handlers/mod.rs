pub mod executor;
pub mod external;
pub mod features;
pub mod file;
pub mod hostname;
pub mod hosts;
pub mod network;
pub mod password;
pub mod resolvers;
pub mod update;
pub mod version;

pub use executor::CommandExecutor;
pub use external::{ExternalHandler, HandlerManifest};
pub use features::FeaturesHandler;
pub use file::FileHandler;
pub use hostname::HostnameHandler;
pub use hosts::HostsHandler;
pub use network::NetworkHandler;
pub use password::PasswordHandler;
pub use resolvers::ResolversHandler;
pub use update::UpdateHandler;
pub use version::VersionHandler;

crate::register_handlers!(settings => [
    NetworkHandler::default(),
    HostsHandler::default(),
    HostnameHandler::default(),
    ResolversHandler::default(),
    PasswordHandler::default(),
    FileHandler,
    UpdateHandler::new(settings.update_command.clone()),
    VersionHandler,
    FeaturesHandler,
]);
