use uncased::Uncased;

#[derive(clap::Parser, Debug)]
pub struct ControlCommand {
    #[arg(long)]
    pub id: String,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(clap::Parser, Debug, PartialEq)]
enum SubCommand {
    On,
    Off,
    Brightness {
        percent: u8,
    },
    Temperature {
        kelvin: u32,
    },
    Color {
        color: csscolorparser::Color,
    },
    Rgb {
        /// Packed RGB value, hex accepted (eg: 0xff0000)
        #[arg(value_parser=clap_num::maybe_hex::<u32>)]
        value: u32,
    },
    Scene {
        /// List available scenes
        #[arg(long)]
        list: bool,

        /// Name of a scene to activate
        #[arg(required_unless_present = "list")]
        scene: Option<String>,
    },
}

impl ControlCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let client = args.api_args.api_client()?;
        let device = client.get_device_by_id(&self.id).await?;

        match &self.cmd {
            SubCommand::On | SubCommand::Off => {
                let result = client
                    .set_power_state(&device, self.cmd == SubCommand::On)
                    .await?;
                println!("{result:#?}");
            }

            SubCommand::Brightness { percent } => {
                let result = client.set_brightness(&device, *percent).await?;
                println!("{result:#?}");
            }

            SubCommand::Temperature { kelvin } => {
                let result = client.set_color_temperature(&device, *kelvin).await?;
                println!("{result:#?}");
            }

            SubCommand::Color { color } => {
                let [r, g, b, _a] = color.to_rgba8();
                let result = client.set_color_rgb(&device, r, g, b).await?;
                println!("{result:#?}");
            }

            SubCommand::Rgb { value } => {
                let r = ((value >> 16) & 0xff) as u8;
                let g = ((value >> 8) & 0xff) as u8;
                let b = (value & 0xff) as u8;
                let result = client.set_color_rgb(&device, r, g, b).await?;
                println!("{result:#?}");
            }

            SubCommand::Scene { list, scene } => {
                let mut caps = client.get_device_scenes(&device).await?;
                caps.extend(client.get_device_diy_scenes(&device).await?);

                if *list {
                    let mut scenes: Vec<_> = caps
                        .iter()
                        .flat_map(|cap| cap.enum_options())
                        .map(|opt| Uncased::new(opt.name.as_str()))
                        .collect();
                    scenes.sort();
                    scenes.dedup();
                    for name in scenes {
                        println!("{name}");
                    }
                } else if let Some(scene) = scene {
                    for cap in &caps {
                        for opt in cap.enum_options() {
                            if scene.eq_ignore_ascii_case(&opt.name) {
                                let result = client
                                    .set_scene_value(&device, &cap.instance, opt.value.clone())
                                    .await?;
                                println!("{result:#?}");
                                return Ok(());
                            }
                        }
                    }
                    anyhow::bail!("Scene '{scene}' is not available for this device");
                }
            }
        }

        Ok(())
    }
}
