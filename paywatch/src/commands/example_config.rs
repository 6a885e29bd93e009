//! `example-config` subcommand

use abscissa_core::{Runnable, Shutdown};
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{
    cli::ExampleConfigCmd,
    config::PaywatchConfig,
    error::{Error, ErrorKind},
    prelude::*,
};

impl ExampleConfigCmd {
    async fn write_example(&self) -> Result<(), Error> {
        let output = PaywatchConfig::generate_example();

        match self.output.as_deref() {
            None | Some("-") => println!("{output}"),
            Some(path) => {
                let mut f = if self.force {
                    File::create(path).await
                } else {
                    File::create_new(path).await
                }
                .map_err(|e| ErrorKind::Config.context(e))?;
                f.write_all(output.as_bytes())
                    .await
                    .map_err(|e| ErrorKind::Config.context(e))?;
                println!("Example config written to {path}");
            }
        }

        Ok(())
    }
}

impl Runnable for ExampleConfigCmd {
    fn run(&self) {
        match abscissa_tokio::run(&APP, self.write_example()) {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                eprintln!("{}", e);
                APP.shutdown_with_exitcode(Shutdown::Forced, 1);
            }
            Err(e) => {
                eprintln!("{}", e);
                APP.shutdown_with_exitcode(Shutdown::Forced, 1);
            }
        }
    }
}
