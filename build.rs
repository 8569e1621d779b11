fn main() {
    let now = time::OffsetDateTime::now_utc();
    let date_fmt = time::format_description::parse("[year][month][day][hour][minute][second]")
        .expect("valid date format");

    let build_id = std::env::var("RADV_BVH_BUILD_ID")
        .unwrap_or_else(|_| now.format(&date_fmt).unwrap_or_else(|_| "unknown".to_string()));

    println!("cargo:rerun-if-env-changed=RADV_BVH_BUILD_ID");
    println!("cargo:rustc-env=RADV_BVH_BUILD_ID={}", build_id);
}
