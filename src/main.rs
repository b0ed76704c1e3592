fn main() {
    if let Err(e) = midimcp_lib::run() {
        eprintln!("midimcp: {}", e);
        std::process::exit(1);
    }
}
