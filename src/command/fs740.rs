//! Stanford Research Systems FS740 GPS time and frequency system.
//!
//! Command catalog for the FS740's SCPI dialect. Parameter ranges follow the
//! instrument manual. Most numeric parameters also accept the `DEF`, `MIN`
//! and `MAX` shortcuts.
//!
//! Channel-suffixed subsystems (`MEAS`, `CONF`, `CALC`, `DATA`, `INP`,
//! `SAMP`, `SENS`) take a `channel` parameter: 1 is the front input, 2 the
//! rear input.

use super::{CommandSpec, ParameterConstraint, ReplyShape, MIN_DEF_MAX};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// Line rate of the FS740 RS-232 port.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// TCP port of the FS740 raw socket interface.
pub const DEFAULT_TCP_PORT: u16 = 5025;

/// Number of fields in a `CALC:STAT?` reply: mean, ASD, min, max, count.
pub const STATISTICS_FIELDS: usize = 5;

/// Number of fields in a time result: timing metric, year, month, day, hour,
/// minute, second, ms, µs, ns, ps.
pub const TIME_FIELDS: usize = 11;

/// Name of the identity query in the catalog.
pub const IDENTIFY: &str = "identify";

/// Immutable, name-indexed set of command specs.
#[derive(Debug)]
pub struct CommandCatalog {
    commands: BTreeMap<String, CommandSpec>,
}

impl CommandCatalog {
    fn from_specs(specs: Vec<CommandSpec>) -> Self {
        Self {
            commands: specs
                .into_iter()
                .map(|spec| (spec.name().to_string(), spec))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

static CATALOG: Lazy<CommandCatalog> = Lazy::new(|| CommandCatalog::from_specs(specs()));

/// The FS740 command catalog.
pub fn catalog() -> &'static CommandCatalog {
    &CATALOG
}

fn channel() -> ParameterConstraint {
    ParameterConstraint::integer("channel", 1, 2).with_default(1)
}

fn frequency(name: &str) -> ParameterConstraint {
    ParameterConstraint::numeric(name, 1e-1, 1.5e8)
        .with_sentinels(MIN_DEF_MAX)
        .with_default("DEF")
}

fn resolution() -> ParameterConstraint {
    ParameterConstraint::numeric("resolution", 1e-16, 1.5e-2)
        .with_sentinels(MIN_DEF_MAX)
        .with_default("DEF")
}

fn location() -> ParameterConstraint {
    ParameterConstraint::integer("location", 0, 9)
}

fn specs() -> Vec<CommandSpec> {
    vec![
        // IEEE 488.2 common commands
        CommandSpec::new(IDENTIFY, "*IDN?")
            .reply(ReplyShape::Text)
            .describe("Instrument identification string"),
        CommandSpec::new("clear_status", "*CLS").describe("Clear status registers and error queue"),
        CommandSpec::new("reset", "*RST").describe("Reset to default settings"),
        CommandSpec::new("operation_complete", "*OPC?"),
        CommandSpec::new("options", "*OPT?").reply(ReplyShape::Text),
        CommandSpec::new("status_byte", "*STB?"),
        CommandSpec::new("recall", "*RCL {location}")
            .param(location())
            .describe("Recall settings; location 0 holds the defaults"),
        CommandSpec::new("save", "*SAV {location}")
            .param(location())
            .describe("Save settings; location 0 is overwritten on key presses"),
        CommandSpec::new("event_status_enable", "*ESE {value}")
            .param(ParameterConstraint::integer("value", 0, 255)),
        CommandSpec::new("service_request_enable", "*SRE {value}")
            .param(ParameterConstraint::integer("value", 0, 255)),
        CommandSpec::new("wait", "*WAI"),
        // Measurement
        CommandSpec::new(
            "measure_frequency",
            "MEAS{channel}:FREQ? {expected}, {resolution}",
        )
        .param(channel())
        .param(frequency("expected"))
        .param(resolution())
        .describe("Configure, trigger and read a frequency measurement in Hz"),
        CommandSpec::new("measure_time", "MEAS{channel}:TIM?")
            .param(channel())
            .reply(ReplyShape::List(TIME_FIELDS))
            .describe("Configure, trigger and read a timestamp of the input edge"),
        CommandSpec::new("configure", "CONF{channel}?")
            .param(channel())
            .reply(ReplyShape::Text),
        CommandSpec::new(
            "configure_frequency",
            "CONF{channel}:FREQ {expected}, {resolution}",
        )
        .param(channel())
        .param(frequency("expected"))
        .param(resolution()),
        CommandSpec::new("configure_time", "CONF{channel}:TIM").param(channel()),
        CommandSpec::new("read", "READ{channel}?")
            .param(channel())
            .describe("Trigger and read with the current configuration"),
        CommandSpec::new("initiate", "INIT{channel}").param(channel()),
        CommandSpec::new("fetch", "FETC{channel}?").param(channel()),
        // READ and FETC answer in the configured mode's format.
        CommandSpec::new("read_time", "READ{channel}?")
            .param(channel())
            .reply(ReplyShape::List(TIME_FIELDS))
            .describe("Trigger and read a time result after configure_time"),
        CommandSpec::new("fetch_time", "FETC{channel}?")
            .param(channel())
            .reply(ReplyShape::List(TIME_FIELDS))
            .describe("Read buffered time results after configure_time"),
        CommandSpec::new("abort", "ABOR{channel}").param(channel()),
        CommandSpec::new("stop", "STOP{channel}").param(channel()),
        // Calculate
        CommandSpec::new("calculate_filter", "CALC:FILT {setting}")
            .param(ParameterConstraint::tokens("setting", &["FAST", "NONE"])),
        CommandSpec::new("calculate_reference", "CALC{channel}:REF {frequency}")
            .param(channel())
            .param(frequency("frequency")),
        CommandSpec::new("calculate_stability", "CALC{channel}:STAB?")
            .param(channel())
            .reply(ReplyShape::Text),
        CommandSpec::new("calculate_statistics", "CALC{channel}:STAT?")
            .param(channel())
            .reply(ReplyShape::List(STATISTICS_FIELDS))
            .describe("Mean, ASD, min, max and number of measurements"),
        // Data
        CommandSpec::new("data_count", "DATA{channel}:COUN?").param(channel()),
        CommandSpec::new("data_points", "DATA{channel}:POIN?").param(channel()),
        CommandSpec::new("data_read", "DATA{channel}:READ? {index}, {count}")
            .param(channel())
            .param(ParameterConstraint::integer("index", 0, i64::from(u32::MAX)))
            .param(ParameterConstraint::integer("count", 0, i64::from(u32::MAX)))
            .reply(ReplyShape::Text),
        CommandSpec::new("data_remove", "DATA{channel}:REM? {count}")
            .param(channel())
            .param(ParameterConstraint::integer("count", 0, i64::from(u32::MAX)))
            .reply(ReplyShape::Text),
        // Input
        CommandSpec::new("input_level", "INP{channel}:LEV {level}")
            .param(channel())
            .param(ParameterConstraint::numeric("level", -3.0, 3.0).with_sentinels(MIN_DEF_MAX)),
        CommandSpec::new("input_slope", "INP{channel}:SLOP {slope}")
            .param(channel())
            .param(ParameterConstraint::tokens("slope", &["NEG", "POS", "DEF"])),
        // Sample
        CommandSpec::new("sample_count", "SAMP{channel}:COUN {count}")
            .param(channel())
            .param(
                ParameterConstraint::integer("count", 1, 1_000_000_000)
                    .with_sentinels(MIN_DEF_MAX),
            ),
        // Sense
        CommandSpec::new("sense_gate", "SENS{channel}:FREQ:GATE {gate}")
            .param(channel())
            .param(ParameterConstraint::numeric("gate", 1e-2, 1e3).with_sentinels(MIN_DEF_MAX)),
        CommandSpec::new("sense_timeout", "SENS{channel}:FREQ:TIM {timeout}")
            .param(channel())
            .param(
                ParameterConstraint::numeric("timeout", 1e-2, 2e3).with_sentinels(MIN_DEF_MAX),
            ),
        CommandSpec::new("sense_time_bmode", "SENS{channel}:TIM:BMOD {mode}")
            .param(channel())
            .param(ParameterConstraint::tokens("mode", &["KFIR", "KLAS"])),
        // System
        CommandSpec::new("system_error", "SYST:ERR?").reply(ReplyShape::Text),
        CommandSpec::new("system_date", "SYST:DATE {year}, {month}, {day}")
            .param(ParameterConstraint::integer("year", 2000, 2099))
            .param(ParameterConstraint::integer("month", 1, 12))
            .param(ParameterConstraint::integer("day", 1, 31)),
        CommandSpec::new("system_time", "SYST:TIM {hour}, {minute}, {second}")
            .param(ParameterConstraint::integer("hour", 0, 23))
            .param(ParameterConstraint::integer("minute", 0, 59))
            .param(ParameterConstraint::integer("second", 0, 59)),
        CommandSpec::new("system_display_screen", "SYST:DISP:SCR {screen}").param(
            ParameterConstraint::tokens(
                "screen",
                &[
                    "TBAS", "GPS", "COMM", "SYST", "SIN", "AUX", "PULS", "MEAS1", "MEAS2",
                ],
            ),
        ),
        CommandSpec::new("system_alarm_mode", "SYST:ALAR:MOD {mode}")
            .param(ParameterConstraint::tokens("mode", &["TRAC", "LATC", "FORC"])),
        CommandSpec::new("system_serial_baud", "SYST:COMM:SER:BAUD {baud}").param(
            ParameterConstraint::integer("baud", 4800, 115_200),
        ),
        // Timebase
        CommandSpec::new("timebase_state", "TBAS?").reply(ReplyShape::Text),
        CommandSpec::new("timebase_interval", "TBAS:TINT? {mode}")
            .param(ParameterConstraint::tokens("mode", &["CURR", "AVER"]).with_default("CURR")),
        // Trigger
        CommandSpec::new("trigger_continuous", "TRIG:CONT {state}")
            .param(ParameterConstraint::tokens("state", &["ON", "OFF"])),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{decode, Arg, Reply};
    use crate::error::ValidationError;

    #[test]
    fn test_catalog_lookup() {
        let catalog = catalog();
        assert!(!catalog.is_empty());
        assert!(catalog.get("measure_frequency").is_some());
        assert!(catalog.get("MEAS:FREQ?").is_none());
        assert!(catalog.names().any(|n| n == IDENTIFY));
    }

    #[test]
    fn test_identity_query_literal() {
        let idn = catalog().get(IDENTIFY).unwrap();
        assert_eq!(idn.build(&[]).unwrap(), "*IDN?");
        assert_eq!(idn.reply_shape(), ReplyShape::Text);
    }

    #[test]
    fn test_measure_frequency_default_literal() {
        let spec = catalog().get("measure_frequency").unwrap();
        assert_eq!(spec.build(&[]).unwrap(), "MEAS1:FREQ? DEF, DEF");
        assert_eq!(
            spec.build(&[Arg::Int(2), Arg::Float(1e7), Arg::Float(1e-9)])
                .unwrap(),
            "MEAS2:FREQ? 10000000, 0.000000001"
        );
        assert_eq!(
            decode("9.99999999876E+06", spec.reply_shape()).unwrap(),
            Reply::Scalar(9.99999999876e6)
        );
    }

    #[test]
    fn test_resolution_accepts_fractional_values() {
        // The resolution range is fractional, so floats must be accepted.
        let spec = catalog().get("configure_frequency").unwrap();
        assert_eq!(
            spec.build(&[Arg::Int(1), Arg::token("MAX"), Arg::Float(1e-12)])
                .unwrap(),
            "CONF1:FREQ MAX, 0.000000000001"
        );
        assert!(spec
            .build(&[Arg::Int(1), Arg::token("DEF"), Arg::Float(0.02)])
            .is_err());
    }

    #[test]
    fn test_channel_is_integer_bound() {
        let spec = catalog().get("measure_time").unwrap();
        assert_eq!(spec.build(&[Arg::Int(2)]).unwrap(), "MEAS2:TIM?");
        assert!(matches!(
            spec.build(&[Arg::Int(3)]),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            spec.build(&[Arg::Float(1.0)]),
            Err(ValidationError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_statistics_reply_shape() {
        let spec = catalog().get("calculate_statistics").unwrap();
        assert_eq!(spec.build(&[]).unwrap(), "CALC1:STAT?");
        let reply = spec
            .decode("1.0000000001E+07, 1.2E-11, 9.9999999E+06, 1.00000001E+07, 10")
            .unwrap();
        assert_eq!(reply.values().len(), STATISTICS_FIELDS);
    }

    #[test]
    fn test_time_reply_shape() {
        for name in ["measure_time", "read_time", "fetch_time"] {
            let spec = catalog().get(name).unwrap();
            assert_eq!(spec.reply_shape(), ReplyShape::List(TIME_FIELDS), "{}", name);
        }
        let spec = catalog().get("measure_time").unwrap();
        assert_eq!(spec.build(&[]).unwrap(), "MEAS1:TIM?");
        let reply = spec.decode("0,2024,5,1,12,0,0,1,2,3,4").unwrap();
        assert_eq!(reply.values().len(), TIME_FIELDS);
        assert_eq!(reply.values()[1], 2024.0);
        assert!(spec.decode("1.0E+07").is_err());
    }

    #[test]
    fn test_every_command_with_defaults_renders() {
        // Commands whose parameters all have defaults must render without
        // leftover placeholders.
        for spec in catalog().iter() {
            if spec.params().iter().all(|p| p.default_value().is_some()) {
                let wire = spec.build(&[]).unwrap();
                assert!(!wire.contains('{'), "{} rendered {}", spec.name(), wire);
            }
        }
    }

    #[test]
    fn test_token_commands() {
        let trig = catalog().get("trigger_continuous").unwrap();
        assert_eq!(trig.build(&[Arg::token("ON")]).unwrap(), "TRIG:CONT ON");
        assert!(trig.build(&[Arg::token("on")]).is_err());

        let slope = catalog().get("input_slope").unwrap();
        assert_eq!(
            slope.build(&[Arg::Int(1), Arg::token("NEG")]).unwrap(),
            "INP1:SLOP NEG"
        );
    }

    #[test]
    fn test_sample_count_sentinels_and_bounds() {
        let spec = catalog().get("sample_count").unwrap();
        assert_eq!(
            spec.build(&[Arg::Int(1), Arg::token("MAX")]).unwrap(),
            "SAMP1:COUN MAX"
        );
        assert!(spec.build(&[Arg::Int(1), Arg::Int(0)]).is_err());
        assert!(spec.build(&[Arg::Int(1), Arg::Float(10.5)]).is_err());
    }
}
