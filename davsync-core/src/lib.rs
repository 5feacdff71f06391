mod client;
mod multistatus;

pub use client::{
    DEFAULT_EXTENSION, DavClient, DavCredentials, DavError, RemoteEntry, RemoteListing,
};
