use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("plotbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: plotbridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("PLOTBRIDGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "protocol: {} {}",
        plotbridge_session::HandshakeConfig::default().protocol_name,
        plotbridge_session::HandshakeConfig::default().protocol_version
    );
    println!(
        "element_types: {}",
        plotbridge_data::DType::ALL
            .iter()
            .map(|dtype| dtype.code().to_string())
            .collect::<Vec<_>>()
            .join("")
    );

    Ok(SUCCESS)
}
