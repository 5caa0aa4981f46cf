use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let proto_path = if Path::new("proto/spiffe_connector.proto").exists() {
        "proto/spiffe_connector.proto"
    } else {
        "../../proto/spiffe_connector.proto"
    };
    let proto_dir = Path::new(proto_path).parent().unwrap();

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_path], &[proto_dir])?;
    println!("cargo:rerun-if-changed={proto_path}");

    Ok(())
}
