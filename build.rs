fn main() {
    // The signal codec is an optional native dependency; default builds use
    // only the trait seam in src/codec.rs.
    if std::env::var("CARGO_FEATURE_NATIVE_QRTONE").is_err() {
        return;
    }

    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=qrtone");
        return;
    }

    // 其他目标：通过 pkg-config 查找 libqrtone
    pkg_config::Config::new()
        .probe("qrtone")
        .expect("Failed to find qrtone. Please install libqrtone.");
}
