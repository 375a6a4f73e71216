fn main() -> Result<(), Box<dyn std::error::Error>> {
    // etcd v3 wire subset (KV, Lease, Watch) plus the registry surface.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/etcd/kv.proto",
                "proto/etcd/rpc.proto",
                "proto/discovery.proto",
            ],
            &["proto"],
        )
        .unwrap_or_else(|e| panic!("protobuf compile error: {}", e));

    Ok(())
}
