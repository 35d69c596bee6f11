fn main() {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var(
            "PROTOC",
            protoc_bin_vendored::protoc_bin_path().unwrap(),
        );
    }

    tonic_build::configure()
        .compile_protos(&["proto/raftfs.proto"], &["proto"])
        .unwrap();

    println!("cargo:rerun-if-changed=proto/raftfs.proto");
}
