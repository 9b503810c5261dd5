//! Derive support for `rill`'s `ShmData` marker trait.
//!
//! A `ShmData` value sits in a queue cell or seqlock slot where another
//! thread — or another process — may byte-copy it while the writer is
//! halfway through a store. The containers detect the overlap and discard
//! the copy, but the copy still *happens*, so the only admissible element
//! types are ones whose bytes are harmless in any state: stable layout, no
//! addresses anywhere inside. This macro checks exactly that at compile
//! time and emits the `unsafe impl`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::visit::{self, Visit};
use syn::{
    Data, DeriveInput, Error, PathSegment, Type, TypePtr, TypeReference, parse_macro_input,
    parse_quote,
};

/// Derive macro for the `ShmData` trait.
///
/// Verifies, at compile time, that a type is plain slot data:
///
/// - its layout is pinned by `#[repr(C)]`, `#[repr(transparent)]`, or (for
///   enums) a primitive repr — the two ends of a channel may be separately
///   compiled binaries, so the compiler's default layout is not enough;
/// - no field carries a process-local address, however deeply nested: heap
///   owners (`Vec`, `Box`, `String`, ...), refcounted pointers, references,
///   raw pointers, and single-process locks are all rejected, and *every*
///   offending field is reported in one pass;
/// - each field type is itself `ShmData`, enforced through generated
///   where-clauses.
///
/// The `Copy + Default` half of the contract rides on the trait's
/// supertraits; derive those alongside:
///
/// ```
/// use rill::ShmData;
///
/// #[derive(ShmData, Clone, Copy, Default)]
/// #[repr(C)]
/// struct ImuFrame {
///     stamp_ns: u64,
///     gyro: [f32; 3],
///     accel: [f32; 3],
/// }
/// ```
///
/// What the checks catch:
///
/// ```compile_fail
/// # use rill::ShmData;
/// #[derive(ShmData, Clone, Copy, Default)]
/// struct NoRepr {  // layout not pinned
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use rill::ShmData;
/// #[derive(ShmData, Clone, Default)]
/// #[repr(C)]
/// struct Owns {
///     bytes: Vec<u8>,  // heap address inside the slot
/// }
/// ```
#[proc_macro_derive(ShmData)]
pub fn shm_data(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand(mut input: DeriveInput) -> syn::Result<TokenStream2> {
    let fields = slot_field_types(&input.data)?;

    // Collect every problem before bailing, so one build surfaces the whole
    // story instead of one offender at a time.
    let mut audit = SlotAudit {
        problems: layout_problem(&input).into_iter().collect(),
    };
    for ty in &fields {
        audit.visit_type(ty);
    }
    if let Some(err) = audit.into_error() {
        return Err(err);
    }

    let rill = rill_path();

    if !fields.is_empty() {
        let bounds = input.generics.make_where_clause();
        for ty in &fields {
            bounds
                .predicates
                .push(parse_quote!(#ty: #rill::__ShmDataPrivate));
        }
    }

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        unsafe impl #impl_generics #rill::__ShmDataPrivate for #ident #ty_generics #where_clause {}
    })
}

/// How downstream code spells the `rill` crate. Inside rill itself the
/// crate aliases its own name, so `::rill` covers that case too.
fn rill_path() -> TokenStream2 {
    match crate_name("rill") {
        Ok(FoundCrate::Name(renamed)) => {
            let ident = format_ident!("{renamed}");
            quote!(::#ident)
        }
        _ => quote!(::rill),
    }
}

/// Harvests the types that would end up inside a slot: struct fields, or
/// the payloads of every enum variant. Unions are refused outright — a
/// torn copy could disagree with whichever interpretation the reader picks.
fn slot_field_types(data: &Data) -> syn::Result<Vec<Type>> {
    match data {
        Data::Struct(s) => Ok(s.fields.iter().map(|f| f.ty.clone()).collect()),
        Data::Enum(e) => Ok(e
            .variants
            .iter()
            .flat_map(|v| v.fields.iter())
            .map(|f| f.ty.clone())
            .collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "ShmData cannot be derived for unions",
        )),
    }
}

/// Reprs that pin the layout well enough to share between binaries.
const STABLE_REPRS: &[&str] = &[
    "C", "transparent", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
    "i128", "isize",
];

/// `None` if some `#[repr(..)]` attribute pins the layout; otherwise the
/// error explaining what is missing.
fn layout_problem(input: &DeriveInput) -> Option<Error> {
    for attr in &input.attrs {
        if !attr.path().is_ident("repr") {
            continue;
        }
        let mut stable = false;
        let scan = attr.parse_nested_meta(|meta| {
            if STABLE_REPRS.iter().any(|repr| meta.path.is_ident(repr)) {
                stable = true;
            } else if meta.input.peek(syn::token::Paren) {
                // repr(align(N)) and repr(packed(N)) carry an argument;
                // consume it so the scan can continue past them. Neither
                // pins field order on its own.
                let args;
                syn::parenthesized!(args in meta.input);
                args.parse::<TokenStream2>()?;
            }
            Ok(())
        });
        match scan {
            Ok(()) if stable => return None,
            Ok(()) => {}
            // An unparseable repr is reported rather than swallowed; rustc
            // will complain about the attribute itself too.
            Err(err) => return Some(err),
        }
    }

    let fix = if matches!(input.data, Data::Enum(_)) {
        "#[repr(C)] or a primitive repr such as #[repr(u8)]"
    } else {
        "#[repr(C)] or #[repr(transparent)]"
    };
    Some(Error::new(
        input.ident.span(),
        format!(
            "ShmData values cross thread and process boundaries as raw bytes, \
             so `{}` must pin its layout with {fix}",
            input.ident
        ),
    ))
}

/// Everything on this list smuggles a process-local address into the slot
/// bytes, which a torn copy in another process would faithfully reproduce.
const ADDRESS_BEARING: &[(&str, &str)] = &[
    ("Box", "owns a heap allocation"),
    ("Vec", "owns a heap allocation"),
    ("String", "owns a heap allocation"),
    ("CString", "owns a heap allocation"),
    ("OsString", "owns a heap allocation"),
    ("PathBuf", "owns a heap allocation"),
    ("Rc", "is a reference-counted pointer"),
    ("Arc", "is a reference-counted pointer"),
    ("Mutex", "synchronizes a single process only"),
    ("RwLock", "synchronizes a single process only"),
    ("Condvar", "synchronizes a single process only"),
    ("Barrier", "synchronizes a single process only"),
];

/// Walks field types via [`syn::visit`], recording every address-bearing
/// component it passes. The default traversal descends through generic
/// arguments, tuples, arrays, and fn-pointer signatures, so `Option<Vec<u8>>`
/// is caught at the `Vec` without any hand-rolled recursion here.
struct SlotAudit {
    problems: Vec<Error>,
}

impl SlotAudit {
    fn into_error(self) -> Option<Error> {
        self.problems.into_iter().reduce(|mut all, next| {
            all.combine(next);
            all
        })
    }
}

impl<'ast> Visit<'ast> for SlotAudit {
    fn visit_path_segment(&mut self, segment: &'ast PathSegment) {
        for &(name, why) in ADDRESS_BEARING {
            if segment.ident == name {
                self.problems.push(Error::new(
                    segment.ident.span(),
                    format!(
                        "`{name}` {why}; its bytes are meaningless in another \
                         process. ShmData fields must hold their data inline \
                         (an array instead of Vec; synchronization belongs to \
                         the container, not the element)"
                    ),
                ));
            }
        }
        visit::visit_path_segment(self, segment);
    }

    fn visit_type_reference(&mut self, reference: &'ast TypeReference) {
        self.problems.push(Error::new(
            reference.span(),
            "references borrow process-local memory and cannot sit in a \
             shared slot; store the data inline",
        ));
        visit::visit_type_reference(self, reference);
    }

    fn visit_type_ptr(&mut self, pointer: &'ast TypePtr) {
        self.problems.push(Error::new(
            pointer.span(),
            "raw pointers are process-local addresses and cannot sit in a \
             shared slot; store the data inline",
        ));
        visit::visit_type_ptr(self, pointer);
    }
}
