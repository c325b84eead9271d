//! Built-in `wvdial` profiles, one per connectivity provider.

/// Provider name that bypasses the modem entirely.
pub const ETHERNET: &str = "Ethernet";

const VODACOM: &str = "\
[Dialer Defaults]
Init1 = ATZ
Init2 = ATQ0 V1 E1 S0=0 &C1 &D2 +FCLASS=0
Init3 = AT+CGDCONT=1,\"IP\",\"vodanet\"
Stupid Mode = 1
Modem Type = Analog Modem
ISDN = 0
Phone = *99#
Modem = /dev/ttyUSB0
Username = { }
Password = { }
Baud = 460800
Auto Reconnect = on
";

const ORANGE: &str = "\
[Dialer Defaults]
Init1 = ATZ
Init2 = ATQ0 V1 E1 S0=0 &C1 &D2 +FCLASS=0
Init3 = AT+CGDCONT=1,\"IP\",\"orange.net\"
Stupid Mode = 1
Modem Type = Analog Modem
ISDN = 0
Phone = *99#
Modem = /dev/ttyUSB0
Username = orange
Password = orange
Baud = 460800
Auto Reconnect = on
";

const AIRTEL: &str = "\
[Dialer Defaults]
Init1 = ATZ
Init2 = ATQ0 V1 E1 S0=0 &C1 &D2 +FCLASS=0
Init3 = AT+CGDCONT=1,\"IP\",\"internet\"
Stupid Mode = 1
Modem Type = Analog Modem
ISDN = 0
Phone = *99#
Modem = /dev/ttyUSB0
Username = { }
Password = { }
Baud = 460800
Auto Reconnect = on
";

const HOLOGRAM: &str = "\
[Dialer Defaults]
Init1 = ATZ
Init2 = ATQ0 V1 E1 S0=0 &C1 &D2 +FCLASS=0
Init3 = AT+CGDCONT=1,\"IP\",\"hologram\"
Stupid Mode = 1
Modem Type = Analog Modem
ISDN = 0
Phone = *99#
Modem = /dev/ttyUSB0
Username = { }
Password = { }
Baud = 460800
Auto Reconnect = on
";

/// Look up the built-in dialup profile for a provider.
pub fn dialup_profile(sim_type: &str) -> Option<&'static str> {
    match sim_type {
        "Vodacom" => Some(VODACOM),
        "Orange" => Some(ORANGE),
        "Airtel" => Some(AIRTEL),
        "Hologram" => Some(HOLOGRAM),
        _ => None,
    }
}
