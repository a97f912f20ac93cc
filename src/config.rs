use bitflags::bitflags;

bitflags! {
    /// Instruction set extensions the emulator is allowed to handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Extensions: u32 {
        /// ANDN BEXTR BLSI BLSMSK BLSR
        const BMI1 = 1 << 0;
        /// BZHI MULX PDEP PEXT RORX SARX SHLX SHRX
        const BMI2 = 1 << 1;
        /// PCMPESTRI PCMPESTRM PCMPISTRI PCMPISTRM
        const SSE42 = 1 << 2;
    }
}

/// CPUID.01H:ECX
const CPUID_1_ECX_SSE42: u32 = 1 << 20;
/// CPUID.(EAX=07H,ECX=0):EBX
const CPUID_7_EBX_BMI1: u32 = 1 << 3;
const CPUID_7_EBX_BMI2: u32 = 1 << 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub extensions: Extensions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extensions: Extensions::all(),
        }
    }
}

impl Config {
    pub fn with_extensions(extensions: Extensions) -> Self {
        Self { extensions }
    }

    /// enable only the extensions the host CPU reports as missing
    ///
    /// takes ECX of CPUID leaf 1 and EBX of CPUID leaf 7 subleaf 0
    pub fn missing_from_cpuid(leaf1_ecx: u32, leaf7_ebx: u32) -> Self {
        let mut extensions = Extensions::empty();
        extensions.set(Extensions::SSE42, leaf1_ecx & CPUID_1_ECX_SSE42 == 0);
        extensions.set(Extensions::BMI1, leaf7_ebx & CPUID_7_EBX_BMI1 == 0);
        extensions.set(Extensions::BMI2, leaf7_ebx & CPUID_7_EBX_BMI2 == 0);
        Self { extensions }
    }

    #[inline]
    pub fn enabled(&self, extension: Extensions) -> bool {
        self.extensions.contains(extension)
    }
}
