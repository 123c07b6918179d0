use amp_core::VatHandle;
use amp_kernel::Kernel;

#[derive(Clone)]
pub(crate) struct AppState {
    vat: VatHandle,
    kernel: Kernel,
    max_content_bytes: usize,
}

impl AppState {
    pub fn new(vat: VatHandle, kernel: Kernel, max_content_bytes: usize) -> Self {
        Self {
            vat,
            kernel,
            max_content_bytes,
        }
    }

    pub fn vat(&self) -> &VatHandle {
        &self.vat
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn max_content_bytes(&self) -> usize {
        self.max_content_bytes
    }
}
