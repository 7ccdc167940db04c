use clap::Parser;

fn main() {
    let cli = devel_install::Cli::parse();
    std::process::exit(devel_install::run(cli));
}
