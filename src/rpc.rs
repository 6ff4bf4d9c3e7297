pub mod server;

/// Generated gRPC bindings for the `latticedb` proto package.
pub mod service {
    tonic::include_proto!("latticedb");
}

pub use server::LatticeKvService;
