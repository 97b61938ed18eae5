fn main() {
    use std::env;
    use std::path::PathBuf;

    println!("cargo:rerun-if-changed=src/public_api.rs");
    println!("cargo:rerun-if-changed=src/errors.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(d) => d,
        Err(_) => return,
    };
    let out_dir = PathBuf::from(&crate_dir).join("include");
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        println!("cargo:warning=cannot create include directory: {e}");
        return;
    }

    let config = match cbindgen::Config::from_file(PathBuf::from(&crate_dir).join("cbindgen.toml")) {
        Ok(c) => c,
        Err(e) => {
            println!("cargo:warning=cannot read cbindgen.toml: {e}");
            return;
        }
    };

    // header is optional for Rust consumers
    match cbindgen::Builder::new()
        .with_config(config)
        .with_crate(&crate_dir)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(out_dir.join("shmroute.h"));
        }
        Err(e) => println!("cargo:warning=unable to generate C bindings: {e}"),
    }
}
