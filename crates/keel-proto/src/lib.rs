pub mod v1 {
    tonic::include_proto!("keel.v1");
}

/// Encoded descriptors for gRPC server reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");
