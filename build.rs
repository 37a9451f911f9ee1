fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/synse/v3/synse.proto");

    let builder = tonic_build::configure()
        .format(true)
        .build_client(true)
        .build_server(true);

    builder.compile(&["proto/synse/v3/synse.proto"], &["proto/synse/v3"])?;

    Ok(())
}
