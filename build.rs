fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto = "proto/processor.proto";

    // The processor contract is vendored so that remote targets written in
    // other languages can compile against the exact same file.
    println!("cargo:rerun-if-changed={proto}");
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&[proto], &["proto"])?;
    Ok(())
}
