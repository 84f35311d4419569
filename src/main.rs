fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match tab_ocr_lib::parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("tab-ocr: {message}");
            eprintln!("{}", tab_ocr_lib::USAGE);
            std::process::exit(2);
        }
    };

    std::process::exit(tab_ocr_lib::run(command))
}
