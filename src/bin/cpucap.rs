fn main() {
    std::process::exit(cpucap::cap::cli::run());
}
