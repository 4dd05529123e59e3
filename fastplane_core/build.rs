fn main() {
    use std::env;
    use std::path::PathBuf;

    let Ok(crate_dir) = env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let src = PathBuf::from(&crate_dir).join("src");
    let out_dir = PathBuf::from(&crate_dir).join("include");

    for file in ["public_api.rs", "errors.rs", "handle_registry.rs", "telemetry.rs"] {
        println!("cargo:rerun-if-changed=src/{file}");
    }

    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        println!("cargo:warning=cannot create {}: {e}", out_dir.display());
        return;
    }

    // Only the C ABI sources are parsed, so no `cargo metadata` run is needed.
    let result = cbindgen::Builder::new()
        .with_language(cbindgen::Language::C)
        .with_include_guard("FASTPLANE_H")
        .with_pragma_once(true)
        .with_src(src.join("public_api.rs"))
        .with_src(src.join("errors.rs"))
        .with_src(src.join("handle_registry.rs"))
        .with_src(src.join("telemetry.rs"))
        .generate();

    match result {
        Ok(bindings) => {
            bindings.write_to_file(out_dir.join("fastplane.h"));
        }
        Err(e) => println!("cargo:warning=header not generated: {e}"),
    }
}
