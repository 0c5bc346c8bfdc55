fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the mesh CA service contract (server side only)
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["proto/ca.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/ca.proto");

    Ok(())
}
