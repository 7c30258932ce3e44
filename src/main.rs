fn main() {
    std::process::exit(polaris_lib::run());
}
