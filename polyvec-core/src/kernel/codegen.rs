//! CUDA C rendering of kernel IR.
//!
//! The rendered source is the structural signature of a kernel: it names parameters by
//! position only, so two trees that differ only in buffers or scalar values render to the
//! same text and share one compiled program.

use std::{
    fmt::Write,
    hash::{DefaultHasher, Hash, Hasher},
};

use super::{KernelIr, KernelKind, Node, ParamKind};
use crate::{random::RandomKind, DType};

/// Threads per block of the reduction kernels.
pub(crate) const REDUCE_BLOCK: usize = 256;

const PRELUDE: &str = r#"
typedef unsigned int uint32_t;
typedef int int32_t;
typedef unsigned long long uint64_t;
typedef long long int int64_t;

template <typename T>
__device__ T polyvec_div(T a, T b) {
    return b == static_cast<T>(0) ? static_cast<T>(0) : a / b;
}
"#;

const STENCIL_HELPER: &str = r#"
template <typename T>
__device__ T polyvec_stencil(const T *w, const T *x, const T *left, const T *right,
                             uint64_t width, uint64_t center, uint64_t nleft, uint64_t total,
                             uint64_t n, uint64_t base, uint64_t i) {
    T sum = static_cast<T>(0);
    for (uint64_t j = 0; j < width; ++j) {
        int64_t g = (int64_t)(base + i) - (int64_t)center + (int64_t)j;
        if (g < 0) g = 0;
        if (g > (int64_t)total - 1) g = (int64_t)total - 1;
        int64_t l = g - (int64_t)base;
        T v = l < 0 ? left[(int64_t)nleft + l] : (l >= (int64_t)n ? right[l - (int64_t)n] : x[l]);
        sum += w[j] * v;
    }
    return sum;
}
"#;

const CSR_HELPER: &str = r#"
template <typename T>
__device__ T polyvec_csr(const uint64_t *row, const uint32_t *col, const T *val, const T *x,
                         const T *ghost, uint64_t local_cols, uint64_t i) {
    T sum = static_cast<T>(0);
    for (uint64_t j = row[i], e = row[i + 1]; j < e; ++j) {
        uint32_t c = col[j];
        sum += val[j] * (c < local_cols ? x[c] : ghost[c - local_cols]);
    }
    return sum;
}
"#;

const CCSR_HELPER: &str = r#"
template <typename T>
__device__ T polyvec_ccsr(const uint32_t *idx, const uint32_t *row, const int32_t *col,
                          const T *val, const T *x, uint64_t i) {
    T sum = static_cast<T>(0);
    uint32_t p = idx[i];
    for (uint32_t j = row[p], e = row[p + 1]; j < e; ++j) {
        sum += val[j] * x[(int64_t)i + col[j]];
    }
    return sum;
}
"#;

const PHILOX_HELPER: &str = r#"
__device__ void polyvec_philox(uint64_t ctr, uint64_t key, uint32_t *w) {
    uint32_t x0 = (uint32_t)ctr, x1 = (uint32_t)(ctr >> 32), x2 = 0, x3 = 0;
    uint32_t k0 = (uint32_t)key, k1 = (uint32_t)(key >> 32);
    for (int r = 0; r < 10; ++r) {
        if (r > 0) {
            k0 += 0x9E3779B9u;
            k1 += 0xBB67AE85u;
        }
        uint64_t p0 = (uint64_t)0xD2511F53u * x0;
        uint64_t p1 = (uint64_t)0xCD9E8D57u * x2;
        uint32_t y0 = (uint32_t)(p1 >> 32) ^ x1 ^ k0;
        uint32_t y2 = (uint32_t)(p0 >> 32) ^ x3 ^ k1;
        x1 = (uint32_t)p1;
        x3 = (uint32_t)p0;
        x0 = y0;
        x2 = y2;
    }
    w[0] = x0; w[1] = x1; w[2] = x2; w[3] = x3;
}
"#;

const THREEFRY_HELPER: &str = r#"
__device__ uint32_t polyvec_rotl(uint32_t x, uint32_t r) {
    return (x << r) | (x >> (32 - r));
}

__device__ void polyvec_threefry(uint64_t ctr, uint64_t key, uint32_t *w) {
    const uint32_t rot[8][2] = {{10, 26}, {11, 21}, {13, 27}, {23, 5},
                                {6, 20}, {17, 11}, {25, 10}, {18, 20}};
    uint32_t ks[5];
    ks[0] = (uint32_t)key;
    ks[1] = (uint32_t)(key >> 32);
    ks[2] = 0;
    ks[3] = 0;
    ks[4] = 0x1BD11BDAu ^ ks[0] ^ ks[1] ^ ks[2] ^ ks[3];
    uint32_t x[4] = {(uint32_t)ctr + ks[0], (uint32_t)(ctr >> 32) + ks[1], ks[2], ks[3]};
    for (uint32_t r = 0; r < 20; ++r) {
        const uint32_t *R = rot[r % 8];
        if (r % 2 == 0) {
            x[0] += x[1]; x[1] = polyvec_rotl(x[1], R[0]); x[1] ^= x[0];
            x[2] += x[3]; x[3] = polyvec_rotl(x[3], R[1]); x[3] ^= x[2];
        } else {
            x[0] += x[3]; x[3] = polyvec_rotl(x[3], R[0]); x[3] ^= x[0];
            x[2] += x[1]; x[1] = polyvec_rotl(x[1], R[1]); x[1] ^= x[2];
        }
        if (r % 4 == 3) {
            uint32_t s = (r + 1) / 4;
            for (uint32_t k = 0; k < 4; ++k) x[k] += ks[(s + k) % 5];
            x[3] += s;
        }
    }
    w[0] = x[0]; w[1] = x[1]; w[2] = x[2]; w[3] = x[3];
}
"#;

#[derive(Default)]
struct Uses {
    stencil: bool,
    csr: bool,
    ccsr: bool,
    philox: bool,
    threefry: bool,
}

impl Uses {
    fn scan(&mut self, node: &Node) {
        match node {
            Node::Stencil(_) => self.stencil = true,
            Node::Csr(_) => self.csr = true,
            Node::Ccsr(_) => self.ccsr = true,
            Node::Random { kind, .. } => match kind {
                RandomKind::Philox => self.philox = true,
                RandomKind::Threefry => self.threefry = true,
            },
            Node::Unary(_, arg) => self.scan(arg),
            Node::Binary(_, lhs, rhs) => {
                self.scan(lhs);
                self.scan(rhs);
            }
            Node::Call(_, args) => args.iter().for_each(|a| self.scan(a)),
            Node::Vector(_) | Node::Scalar(_) | Node::Index(_) | Node::Local(_) => {}
        }
    }
}

fn function_name(name: &str) -> String {
    format!("polyvec_fn_{name}")
}

fn param_decl(kind: ParamKind, ty: &str, slot: usize) -> String {
    match kind {
        ParamKind::Values => format!("const {ty} *p{slot}"),
        ParamKind::Scalar => format!("{ty} p{slot}"),
        ParamKind::Offset => format!("int64_t p{slot}"),
        ParamKind::Count => format!("uint64_t p{slot}"),
        ParamKind::Rows => format!("const uint64_t *p{slot}"),
        ParamKind::Columns => format!("const uint32_t *p{slot}"),
        ParamKind::Shifts => format!("const int32_t *p{slot}"),
    }
}

fn slots(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|s| format!("p{s}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Can assume that the kernel is templated on `T`.
fn handle_node<T: DType>(node: &Node, ir: &KernelIr<T>) -> String {
    match node {
        Node::Vector(s) => format!("p{s}[i]"),
        Node::Scalar(s) => format!("p{s}"),
        Node::Index(s) => format!("static_cast<T>((int64_t)(base + i) + p{s})"),
        Node::Local(k) => format!("l{k}"),
        Node::Unary(op, arg) => op.fill_in_c_op::<T>(handle_node(arg, ir)),
        Node::Binary(op, lhs, rhs) => {
            op.fill_in_c_op::<T>(handle_node(lhs, ir), handle_node(rhs, ir))
        }
        Node::Call(pos, args) => {
            let args = args
                .iter()
                .map(|a| handle_node(a, ir))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}({args})", function_name(ir.functions[*pos].name()))
        }
        Node::Stencil(s) => format!(
            "polyvec_stencil<T>({}, n, base, i)",
            slots(*s, super::STENCIL_PARAMS)
        ),
        Node::Csr(s) => format!("polyvec_csr<T>({}, i)", slots(*s, super::CSR_PARAMS)),
        Node::Ccsr(s) => format!("polyvec_ccsr<T>({}, i)", slots(*s, super::CCSR_PARAMS)),
        Node::Random { kind, seed, offset } => format!(
            "polyvec_{}_value((uint64_t)((int64_t)(base + i) + p{offset}), p{seed})",
            kind.c_name()
        ),
    }
}

fn hash_name(prefix: &str, body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("polyvec_{prefix}_{:016x}", hasher.finish())
}

/// Render `ir` to a kernel name and its complete source.
pub(crate) fn render<T: DType>(ir: &KernelIr<T>) -> (String, String) {
    let ty = T::C_NAME;
    let mut uses = Uses::default();
    ir.locals.iter().for_each(|l| uses.scan(l));
    uses.scan(&ir.body);

    let mut helpers = String::new();
    for (used, helper) in [
        (uses.stencil, STENCIL_HELPER),
        (uses.csr, CSR_HELPER),
        (uses.ccsr, CCSR_HELPER),
        (uses.philox, PHILOX_HELPER),
        (uses.threefry, THREEFRY_HELPER),
    ] {
        if used {
            helpers += helper;
        }
    }
    for (used, kind) in [
        (uses.philox, RandomKind::Philox),
        (uses.threefry, RandomKind::Threefry),
    ] {
        if used {
            let family = kind.c_name();
            let _ = write!(
                helpers,
                r#"
__device__ {ty} polyvec_{family}_value(uint64_t ctr, uint64_t key) {{
    uint32_t w[4];
    polyvec_{family}(ctr, key, w);
    uint32_t w0 = w[0], w1 = w[1];
    return {};
}}
"#,
                T::C_FROM_WORDS
            );
        }
    }
    for func in &ir.functions {
        let params = (1..=func.arity())
            .map(|k| format!("{ty} prm{k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let body = func.inner.device.as_deref().unwrap_or("");
        let _ = write!(
            helpers,
            "\n__device__ {ty} {}({params}) {{\n    {body}\n}}\n",
            function_name(func.name())
        );
    }

    let mut header = String::new();
    for (k, local) in ir.locals.iter().enumerate() {
        let _ = writeln!(header, "        const T l{k} = {};", handle_node(local, ir));
    }
    let value = handle_node(&ir.body, ir);

    let template_params = ir
        .params
        .iter()
        .enumerate()
        .map(|(s, kind)| format!(", {}", param_decl(*kind, "T", s)))
        .collect::<String>();
    let extern_params = ir
        .params
        .iter()
        .enumerate()
        .map(|(s, kind)| format!(", {}", param_decl(*kind, ty, s)))
        .collect::<String>();
    let forwarded = (0..ir.params.len())
        .map(|s| format!(", p{s}"))
        .collect::<String>();

    let (prefix, target_decl, target_extern, target_fwd, body) = match ir.kind {
        KernelKind::Assign(op) => {
            let store = match op.as_binary() {
                Some(bin) => bin.fill_in_c_op::<T>("out[i]", &value),
                None => value,
            };
            (
                "assign",
                "T *out".to_string(),
                format!("{ty} *out"),
                "out",
                format!(
                    r#"    for (uint64_t i = (uint64_t)blockIdx.x * blockDim.x + threadIdx.x; i < n;
         i += (uint64_t)blockDim.x * gridDim.x) {{
{header}        out[i] = {store};
    }}"#
                ),
            )
        }
        KernelKind::Reduce(op) => {
            let bin = op.as_binary();
            let step = bin.fill_in_c_op::<T>("acc", &value);
            let fold = bin.fill_in_c_op::<T>("shm[threadIdx.x]", "shm[threadIdx.x + s]");
            (
                op.name(),
                "T *partials, const T identity".to_string(),
                format!("{ty} *partials, const {ty} identity"),
                "partials, identity",
                format!(
                    r#"    __shared__ T shm[{REDUCE_BLOCK}];
    T acc = identity;
    for (uint64_t i = (uint64_t)blockIdx.x * blockDim.x + threadIdx.x; i < n;
         i += (uint64_t)blockDim.x * gridDim.x) {{
{header}        acc = {step};
    }}
    shm[threadIdx.x] = acc;
    __syncthreads();
    for (unsigned int s = blockDim.x / 2; s > 0; s >>= 1) {{
        if (threadIdx.x < s) {{
            shm[threadIdx.x] = {fold};
        }}
        __syncthreads();
    }}
    if (threadIdx.x == 0) {{
        partials[blockIdx.x] = shm[0];
    }}"#
                ),
            )
        }
    };

    let signature = format!(
        "{helpers}\n{target_decl}{template_params}\n{body}\n{ty}{extern_params}"
    );
    let name = hash_name(prefix, &signature);
    let source = format!(
        r#"{PRELUDE}{helpers}
template <typename T>
__device__ void {name}_kernel(const uint64_t n, const uint64_t base, {target_decl}{template_params}) {{
{body}
}}

extern "C" __global__ void {name}(const uint64_t n, const uint64_t base, {target_extern}{extern_params}) {{
    {name}_kernel<{ty}>(n, base, {target_fwd}{forwarded});
}}
"#
    );
    (name, source)
}

/// One compare-exchange stage of a bitonic sort over keys and, optionally, values.
///
/// With `flip` set, element `off` of each block of `2 * half` is paired with element
/// `2 * half - 1 - off`; otherwise with `off + half`. Pairs reaching past `n` are skipped,
/// which sorts lengths that are not a power of two.
pub(crate) fn render_sort<K: DType, V: DType>(
    device_body: &str,
    with_values: bool,
) -> (String, String) {
    let kty = K::C_NAME;
    let vty = V::C_NAME;
    let (vals_param, vals_swap) = if with_values {
        (
            format!(", {vty} *vals"),
            format!("        {vty} v = vals[lo]; vals[lo] = vals[hi]; vals[hi] = v;\n"),
        )
    } else {
        (String::new(), String::new())
    };
    let helpers = format!(
        "\n__device__ bool polyvec_cmp({kty} prm1, {kty} prm2) {{\n    {device_body}\n}}\n"
    );
    let body = format!(
        r#"    uint64_t t = (uint64_t)blockIdx.x * blockDim.x + threadIdx.x;
    uint64_t group = t / half, off = t % half;
    uint64_t lo = group * 2 * half + off;
    uint64_t hi = flip ? group * 2 * half + 2 * half - 1 - off : lo + half;
    if (hi < n && polyvec_cmp(keys[hi], keys[lo])) {{
        {kty} k = keys[lo]; keys[lo] = keys[hi]; keys[hi] = k;
{vals_swap}    }}"#
    );
    let name = hash_name("sort", &format!("{helpers}{kty}{vals_param}{body}"));
    let source = format!(
        r#"{PRELUDE}{helpers}
extern "C" __global__ void {name}({kty} *keys{vals_param}, const uint64_t n, const uint64_t half, const uint32_t flip) {{
{body}
}}
"#
    );
    (name, source)
}
