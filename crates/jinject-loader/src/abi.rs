use std::{fmt, str::FromStr};

/// Android native ABIs a library build can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Abi {
    Armeabi,
    ArmeabiV7a,
    Arm64V8a,
    X86,
    X86_64,
    Mips,
    Mips64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown ABI {0:?}")]
pub struct UnknownAbi(pub String);

impl Abi {
    pub const ALL: [Abi; 7] = [
        Abi::Armeabi,
        Abi::ArmeabiV7a,
        Abi::Arm64V8a,
        Abi::X86,
        Abi::X86_64,
        Abi::Mips,
        Abi::Mips64,
    ];

    /// The name used by `android.os.Build.CPU_ABI` and APK `lib/` directories.
    pub fn name(self) -> &'static str {
        match self {
            Abi::Armeabi => "armeabi",
            Abi::ArmeabiV7a => "armeabi-v7a",
            Abi::Arm64V8a => "arm64-v8a",
            Abi::X86 => "x86",
            Abi::X86_64 => "x86_64",
            Abi::Mips => "mips",
            Abi::Mips64 => "mips64",
        }
    }

    pub fn from_name(name: &str) -> Option<Abi> {
        Abi::ALL.into_iter().find(|abi| abi.name() == name)
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Abi {
    type Err = UnknownAbi;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Abi::from_name(s.trim()).ok_or_else(|| UnknownAbi(s.to_string()))
    }
}
