/// Sample data type of a resource element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    #[default]
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
}

impl SampleFormat {
    /// Width of one sample in bytes.
    pub fn width(self) -> usize {
        match self {
            SampleFormat::UInt8 | SampleFormat::Int8 => 1,
            SampleFormat::UInt16 | SampleFormat::Int16 => 2,
            SampleFormat::UInt32 | SampleFormat::Int32 => 4,
        }
    }
}

/// Channel layout of a resource element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelOrder {
    #[default]
    R,
    Rgb,
    Rgba,
    Bgra,
}

impl ChannelOrder {
    pub fn count(self) -> usize {
        match self {
            ChannelOrder::R => 1,
            ChannelOrder::Rgb => 3,
            ChannelOrder::Rgba | ChannelOrder::Bgra => 4,
        }
    }
}

/// Element format: channel layout plus sample type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub sample: SampleFormat,
}

impl ImageFormat {
    pub fn new(order: ChannelOrder, sample: SampleFormat) -> Self {
        Self { order, sample }
    }

    /// Bytes per element.
    pub fn element_size(self) -> usize {
        self.order.count() * self.sample.width()
    }
}

/// Shape of a [`MappedResource`](super::MappedResource): a linear buffer or a
/// 2-D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer { len: usize, format: ImageFormat },
    Image { width: usize, height: usize, format: ImageFormat },
}

impl ResourceKind {
    /// A buffer of `len` single-channel bytes.
    pub fn bytes(len: usize) -> Self {
        ResourceKind::Buffer {
            len,
            format: ImageFormat::default(),
        }
    }

    pub fn buffer(len: usize, format: ImageFormat) -> Self {
        ResourceKind::Buffer { len, format }
    }

    pub fn image(width: usize, height: usize, format: ImageFormat) -> Self {
        ResourceKind::Image { width, height, format }
    }

    pub fn format(&self) -> ImageFormat {
        match self {
            ResourceKind::Buffer { format, .. } | ResourceKind::Image { format, .. } => *format,
        }
    }

    /// Number of elements in the resource.
    pub fn elements(&self) -> usize {
        match self {
            ResourceKind::Buffer { len, .. } => *len,
            ResourceKind::Image { width, height, .. } => width.saturating_mul(*height),
        }
    }

    /// Total size in bytes. Saturates instead of overflowing so oversized
    /// requests are rejected by the device's allocation limit.
    pub fn byte_size(&self) -> usize {
        self.elements().saturating_mul(self.format().element_size())
    }
}

/// Which side produces the data held in a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host writes, device reads. Unmapping publishes host bytes to the device.
    HostToDevice,
    /// Device writes, host reads. Mapping copies device bytes to the host.
    DeviceToHost,
}
