//! Shared resource names, attributes, bodies and their loading.
//!
//! Client code holds [`Handle`]s obtained from a [`UrlManager`]. Every handle
//! for the same name refers to one shared [`ResourceRep`] whose attributes,
//! load state and body are visible through all of them.

pub mod attr;
pub mod cache;
pub mod content;
pub mod data_url;
pub mod descriptor;
pub mod handle;
pub mod manager;
pub mod name;
pub mod rep;
pub mod scheme;
pub mod server;

pub use attr::DynamicAttr;
pub use attr::DynamicKind;
pub use attr::StrAttr;
pub use attr::UintAttr;
pub use attr::UrlAttr;
pub use attr::ValueAttr;
pub use cache::CheckExpiry;
pub use cache::ExpiryCheck;
pub use content::ContentType;
pub use descriptor::DataDescriptor;
pub use descriptor::DescriptorOptions;
pub use handle::Handle;
pub use handle::Redirect;
pub use handle::ServerCheck;
pub use manager::CommState;
pub use manager::LoadOptions;
pub use manager::ManagerConfig;
pub use manager::ReloadKind;
pub use manager::ReloadOutcome;
pub use manager::UrlManager;
pub use name::CredentialVariant;
pub use name::NameVariant;
pub use name::PathVariant;
pub use name::SensitiveName;
pub use rep::InUse;
pub use rep::LoadStatus;
pub use rep::ResourceRep;
pub use scheme::UrlType;
pub use server::ServerName;
pub use server::ServerNameRegistry;
