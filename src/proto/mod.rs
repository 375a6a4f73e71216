//! Protocol Buffer definitions and generated code for RPC services.
//!
//! Generated by [`tonic-build`] from the files under `proto/` at build time:
//! the etcd v3 subset consumed by [`crate::EtcdClient`] and the registry
//! surface served by [`crate::RegistryServicer`].

pub mod mvccpb {
    tonic::include_proto!("mvccpb");
}

pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}

pub mod discovery {
    tonic::include_proto!("discovery");
}

mod convert;
pub(crate) use convert::*;
