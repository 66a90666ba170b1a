fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=proto/report.proto");
    prost_build::Config::new().compile_protos(&["proto/report.proto"], &["proto"])
}
